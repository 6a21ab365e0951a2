//! Build automation tasks for the spanner-sessions workspace.
//!
//! Run with `cargo xtask <command>`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

/// Feature sets each published crate must build with.
const FEATURE_MATRIX: &[(&str, &[&str])] = &[
    ("spanner-protocol", &[""]),
    ("spanner-client", &["", "otel"]),
    ("spanner-session-pool", &["", "serde", "otel"]),
    ("spanner-database", &["", "serde", "otel", "serde,otel"]),
];

/// Targets under `fuzz/fuzz_targets`.
const FUZZ_TARGETS: &[&str] = &["retry_info_decode", "database_path", "service_error_metadata"];

#[derive(Parser)]
#[command(name = "xtask", about = "Build automation for spanner-sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every check: format, lint, feature matrix, tests, cargo-deny
    Ci {
        /// Also build the fuzz targets (needs nightly and cargo-fuzz)
        #[arg(long)]
        fuzz: bool,
    },
    /// Run cargo fmt --check
    Fmt,
    /// Run clippy with all features
    Clippy,
    /// Check each crate with every supported feature combination
    Features,
    /// Run all tests with all features
    Test,
    /// Run cargo-deny checks
    Deny,
    /// Generate documentation
    Doc,
    /// Build the fuzz targets, optionally running each for a while
    Fuzz {
        /// Seconds to run each target; build only when omitted
        #[arg(long)]
        run: Option<u32>,
    },
    /// Clean build artifacts
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    sh.change_dir(workspace_root()?);

    match cli.command {
        Command::Ci { fuzz: with_fuzz } => {
            println!("Running CI checks...");
            fmt(&sh)?;
            clippy(&sh)?;
            features(&sh)?;
            test(&sh)?;
            deny(&sh)?;
            if with_fuzz {
                fuzz(&sh, None)?;
            }
            println!("All CI checks passed!");
        }
        Command::Fmt => fmt(&sh)?,
        Command::Clippy => clippy(&sh)?,
        Command::Features => features(&sh)?,
        Command::Test => test(&sh)?,
        Command::Deny => deny(&sh)?,
        Command::Doc => doc(&sh)?,
        Command::Fuzz { run } => fuzz(&sh, run)?,
        Command::Clean => cmd!(sh, "cargo clean").run()?,
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("failed to run cargo locate-project")?;

    let manifest = String::from_utf8(output.stdout).context("invalid UTF-8 in cargo output")?;
    Ok(PathBuf::from(manifest.trim())
        .parent()
        .context("failed to get workspace root")?
        .to_path_buf())
}

fn fmt(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo clippy --workspace --all-features --all-targets -- -D warnings").run()?;
    Ok(())
}

fn features(sh: &Shell) -> Result<()> {
    for (package, sets) in FEATURE_MATRIX {
        for &set in *sets {
            let label = if set.is_empty() { "no features" } else { set };
            println!("Checking {package} ({label})...");
            let mut args = vec!["--no-default-features"];
            if !set.is_empty() {
                args.extend(["--features", set]);
            }
            cmd!(sh, "cargo check -p {package} --all-targets {args...}")
                .run()
                .with_context(|| format!("{package} failed to build with {label}"))?;
        }
    }
    Ok(())
}

fn test(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo test --workspace --all-features").run()?;
    Ok(())
}

fn deny(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo deny check").run()?;
    Ok(())
}

fn doc(sh: &Shell) -> Result<()> {
    let _env = sh.push_env("RUSTDOCFLAGS", "-D warnings");
    cmd!(sh, "cargo doc --workspace --all-features --no-deps").run()?;
    Ok(())
}

fn fuzz(sh: &Shell, run: Option<u32>) -> Result<()> {
    let _dir = sh.push_dir("fuzz");
    cmd!(sh, "cargo +nightly fuzz build").run()?;

    if let Some(seconds) = run {
        let limit = format!("-max_total_time={seconds}");
        for target in FUZZ_TARGETS {
            println!("Fuzzing {target} for {seconds}s...");
            cmd!(sh, "cargo +nightly fuzz run {target} -- {limit}").run()?;
        }
    }
    Ok(())
}
