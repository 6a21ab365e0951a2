//! Client configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use spanner_protocol::SessionTemplate;

use crate::error::Error;
use crate::runner::DEFAULT_TRANSACTION_TIMEOUT;

/// Fully qualified database path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    /// Project id.
    pub project: String,
    /// Instance id.
    pub instance: String,
    /// Database id.
    pub database: String,
}

impl DatabaseId {
    /// Create a database id from its components.
    pub fn new(
        project: impl Into<String>,
        instance: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            instance: instance.into(),
            database: database.into(),
        }
    }

    /// Parse `projects/{project}/instances/{instance}/databases/{database}`.
    pub fn parse(path: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = path.trim().trim_matches('/').split('/').collect();

        let [
            "projects",
            project,
            "instances",
            instance,
            "databases",
            database,
        ] = parts.as_slice()
        else {
            return Err(Error::Config(format!(
                "invalid database path '{path}': expected \
                 projects/{{project}}/instances/{{instance}}/databases/{{database}}"
            )));
        };

        validate_resource_id("project", project)?;
        validate_resource_id("instance", instance)?;
        validate_resource_id("database", database)?;

        Ok(Self::new(*project, *instance, *database))
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/instances/{}/databases/{}",
            self.project, self.instance, self.database
        )
    }
}

impl FromStr for DatabaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validate one component of a resource path.
fn validate_resource_id(kind: &str, id: &str) -> Result<(), Error> {
    use once_cell::sync::Lazy;
    use regex::Regex;

    #[allow(clippy::expect_used)]
    static RESOURCE_ID_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.:\-]{0,99}$").expect("static regex is valid")
    });

    if id.is_empty() {
        return Err(Error::Config(format!("{kind} id cannot be empty")));
    }

    if !RESOURCE_ID_RE.is_match(id) {
        return Err(Error::Config(format!(
            "invalid {kind} id '{id}': must start with a letter or digit, \
             contain only alphanumerics/_/./:/-, and be 1-100 characters"
        )));
    }

    Ok(())
}

/// Configuration shared by every session a client creates.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database the sessions belong to.
    pub database: DatabaseId,

    /// Database role for fine-grained access control.
    pub database_role: Option<String>,

    /// Labels applied to created sessions.
    pub labels: BTreeMap<String, String>,

    /// Total time the transaction runner may spend retrying.
    pub transaction_timeout: Duration,
}

impl Config {
    /// Create a configuration for `database` with default values.
    #[must_use]
    pub fn new(database: DatabaseId) -> Self {
        Self {
            database,
            database_role: None,
            labels: BTreeMap::new(),
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
        }
    }

    /// Parse a database path into a configuration.
    pub fn from_database_path(path: &str) -> Result<Self, Error> {
        Ok(Self::new(DatabaseId::parse(path)?))
    }

    /// Set the database role.
    #[must_use]
    pub fn database_role(mut self, role: impl Into<String>) -> Self {
        self.database_role = Some(role.into());
        self
    }

    /// Add a session label.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the transaction retry timeout.
    #[must_use]
    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Session template for regular (pooled) sessions.
    #[must_use]
    pub fn session_template(&self) -> SessionTemplate {
        SessionTemplate {
            labels: self.labels.clone(),
            multiplexed: false,
            creator_role: self.database_role.clone(),
        }
    }
}
