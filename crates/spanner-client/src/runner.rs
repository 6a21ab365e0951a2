//! Transaction runner: retries a user function on abort-class errors.
//!
//! ```text
//! NotStarted -> Attempting -> Succeeded
//!                          -> UserError
//!                          -> Retrying -> Attempting
//!                          -> DeadlineExceeded
//! ```
//!
//! The first attempt always runs. Before every later attempt the elapsed
//! wall-clock time is checked against the configured timeout. The delay
//! between attempts comes from the server's `RetryInfo` when present,
//! otherwise from capped exponential backoff with jitter. Expired sessions
//! are retried immediately on a renewed session; a runner without a
//! [`SessionSource`] returns the error instead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use spanner_protocol::{Code, ServiceError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result, is_retryable};
use crate::session::Session;
use crate::transaction::Transaction;

/// Default total time a runner may spend on a transaction (one hour).
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Backoff stops growing after `2^MAX_BACKOFF_EXPONENT` seconds.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Upper bound (exclusive) of the random jitter added to computed backoff.
const MAX_JITTER_MS: u64 = 1000;

/// The runner exceeded its timeout.
///
/// Carries the last retryable error observed.
#[derive(Debug, Clone, Error)]
#[error("Deadline for Transaction exceeded.")]
pub struct DeadlineError {
    #[source]
    last_error: Option<ServiceError>,
}

impl DeadlineError {
    /// Create a deadline error wrapping the last retryable error.
    #[must_use]
    pub fn new(last_error: Option<ServiceError>) -> Self {
        Self { last_error }
    }

    /// Status code reported for the failure.
    #[must_use]
    pub fn code(&self) -> Code {
        Code::DeadlineExceeded
    }

    /// The last retryable error before the deadline passed.
    #[must_use]
    pub fn last_error(&self) -> Option<&ServiceError> {
        self.last_error.as_ref()
    }
}

/// Options for running a transaction.
#[derive(Debug, Clone, Copy)]
pub struct RunTransactionOptions {
    /// Total time allowed across all attempts.
    pub timeout: Duration,
}

impl Default for RunTransactionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TRANSACTION_TIMEOUT,
        }
    }
}

impl RunTransactionOptions {
    /// Set the total timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Where the runner is in its retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// No attempt made yet.
    NotStarted,
    /// The user function is running.
    Attempting,
    /// Waiting before the next attempt.
    Retrying,
    /// The user function succeeded.
    Succeeded,
    /// The user function failed with a non-retryable error.
    UserError,
    /// The timeout passed while retrying.
    DeadlineExceeded,
}

/// Supplies a replacement when the server reports a session as not found.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Discard `stale` and return a usable session.
    async fn renew(&self, stale: Arc<Session>) -> Result<Arc<Session>>;
}

/// Capped exponential backoff: `min(2^attempts, 2^5)` seconds plus up to
/// one second of jitter.
#[must_use]
pub fn exponential_backoff(attempts: u32) -> Duration {
    let base_ms = (1u64 << attempts.min(MAX_BACKOFF_EXPONENT)) * 1000;
    let jitter_ms = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
    Duration::from_millis(base_ms + jitter_ms)
}

/// Runs a user function against a transaction, retrying on abort-class
/// errors until it succeeds, fails fatally, or the timeout passes.
pub struct TransactionRunner {
    session: Arc<Session>,
    transaction: Option<Arc<Transaction>>,
    options: RunTransactionOptions,
    source: Option<Arc<dyn SessionSource>>,
    attempts: u32,
    last_seqno: u64,
    state: RunnerState,
}

impl TransactionRunner {
    /// Create a runner.
    ///
    /// `transaction` is used for the first attempt if given; it may already
    /// have begun as a side effect of an earlier statement.
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        transaction: Option<Arc<Transaction>>,
        options: RunTransactionOptions,
    ) -> Self {
        Self {
            session,
            transaction,
            options,
            source: None,
            attempts: 0,
            last_seqno: 0,
            state: RunnerState::NotStarted,
        }
    }

    /// Renew expired sessions through `source`.
    #[must_use]
    pub fn with_session_source(mut self, source: Arc<dyn SessionSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Retries performed so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// The session the runner currently uses. Changes if it was renewed.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Delay before the next attempt after `err`.
    #[must_use]
    pub fn next_delay(&self, err: &ServiceError) -> Duration {
        if err.is_session_not_found() {
            return Duration::ZERO;
        }
        if let Some(delay) = err.retry_delay() {
            return delay;
        }
        exponential_backoff(self.attempts)
    }

    /// Run `f`, intercepting retryable errors from the transaction's
    /// requests so they never reach `f`.
    ///
    /// When a request made through the transaction fails with a retryable
    /// error, the current attempt is abandoned (the future returned by `f`
    /// is dropped) and a new attempt starts.
    pub async fn run<T, F, Fut>(&mut self, f: F) -> Result<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_loop(f, true).await
    }

    /// Run `f`, inspecting the error it returns.
    pub async fn run_async<T, F, Fut>(&mut self, f: F) -> Result<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_loop(f, false).await
    }

    async fn run_loop<T, F, Fut>(&mut self, mut f: F, intercept: bool) -> Result<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let timeout = self.options.timeout;
        let mut last_error: Option<ServiceError> = None;

        loop {
            if self.attempts > 0 && start.elapsed() >= timeout {
                self.state = RunnerState::DeadlineExceeded;
                return Err(DeadlineError::new(last_error).into());
            }

            self.state = RunnerState::Attempting;
            let err = match self.attempt(&mut f, intercept).await {
                Ok(value) => {
                    self.state = RunnerState::Succeeded;
                    return Ok(value);
                }
                Err(Error::Service(err)) if is_retryable(&err) => err,
                Err(err) => {
                    self.state = RunnerState::UserError;
                    return Err(err);
                }
            };

            // Without a source the same dead session would fail every retry.
            if err.is_session_not_found() && self.source.is_none() {
                self.state = RunnerState::UserError;
                return Err(Error::Service(err));
            }

            self.attempts += 1;
            let delay = self.next_delay(&err);

            if start.elapsed() + delay >= timeout {
                self.state = RunnerState::DeadlineExceeded;
                return Err(DeadlineError::new(Some(err)).into());
            }

            if err.is_session_not_found() {
                if let Some(source) = self.source.clone() {
                    self.renew_session(source.as_ref()).await?;
                }
            }

            tracing::debug!(
                attempt = self.attempts,
                code = %err.code,
                delay_ms = delay.as_millis() as u64,
                "retrying transaction"
            );

            self.state = RunnerState::Retrying;
            last_error = Some(err);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn attempt<T, F, Fut>(&mut self, f: &mut F, intercept: bool) -> Result<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let transaction = self.get_transaction().await?;

        let result = if intercept {
            let (sender, mut receiver) = mpsc::unbounded_channel();
            transaction.set_interceptor(sender);
            let result = tokio::select! {
                biased;
                Some(err) = receiver.recv() => Err(Error::Service(err)),
                result = f(Arc::clone(&transaction)) => result,
            };
            transaction.clear_interceptor();
            result
        } else {
            f(Arc::clone(&transaction)).await
        };

        self.last_seqno = self.last_seqno.max(transaction.seqno());
        if result.is_err() {
            transaction.end();
        }
        result
    }

    /// A pre-bound transaction (given at construction, or prepared on a
    /// renewed session) is used as is. Otherwise attempt 0 begins inline
    /// and later attempts begin a fresh transaction explicitly.
    async fn get_transaction(&mut self) -> Result<Arc<Transaction>> {
        let transaction = match self.transaction.take() {
            Some(transaction) => transaction,
            None => {
                let transaction = self.session.transaction()?;
                if self.attempts > 0 {
                    transaction.begin().await?;
                }
                transaction
            }
        };
        if self.attempts > 0 {
            transaction.resume_sequence_from(self.last_seqno);
        }

        transaction.set_attempts(self.attempts);
        transaction.set_timeout(self.options.timeout);
        Ok(transaction)
    }

    async fn renew_session(&mut self, source: &dyn SessionSource) -> Result<()> {
        tracing::info!(
            session = ?self.session.name(),
            "session not found, renewing before retry"
        );
        self.session = source.renew(Arc::clone(&self.session)).await?;
        self.transaction = self.session.take_prepared_transaction();
        Ok(())
    }
}

impl std::fmt::Debug for TransactionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRunner")
            .field("session", &self.session.name())
            .field("attempts", &self.attempts)
            .field("state", &self.state)
            .field("timeout", &self.options.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_options() {
        let options = RunTransactionOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(3600));
        let options = options.timeout(Duration::from_secs(5));
        assert_eq!(options.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_deadline_error_wraps_last() {
        let err = DeadlineError::new(Some(ServiceError::new(Code::Aborted, "aborted")));
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert_eq!(err.last_error().map(|e| e.code), Some(Code::Aborted));
        assert_eq!(err.to_string(), "Deadline for Transaction exceeded.");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_backoff_caps_at_32_seconds() {
        for attempts in [5, 6, 10, 100, u32::MAX] {
            let delay = exponential_backoff(attempts);
            assert!(delay >= Duration::from_secs(32));
            assert!(delay < Duration::from_secs(33));
        }
    }

    proptest! {
        #[test]
        fn prop_backoff_within_bounds(attempts in 0u32..64) {
            let delay = exponential_backoff(attempts);
            let base = Duration::from_secs(1 << attempts.min(MAX_BACKOFF_EXPONENT));
            prop_assert!(delay >= base);
            prop_assert!(delay < base + Duration::from_millis(MAX_JITTER_MS));
        }
    }
}
