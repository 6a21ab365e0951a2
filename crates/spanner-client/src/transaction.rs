//! Transaction support.
//!
//! A [`Transaction`] is bound to one session for its whole life. It begins
//! either explicitly ([`Transaction::begin`]) or inline with its first
//! statement, buffers mutations until commit, and stamps every `ExecuteSql`
//! request with a strictly increasing sequence number so the server can
//! recognize replayed DML.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use spanner_protocol::{
    CommitRequest, CommitResponse, ExecuteSqlRequest, KeySet, Mutation, PartialResultSet,
    ReadRequest, ResultSet, ServiceError, Statement, TransactionOptions, TransactionSelector,
    Value, Write,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::error::{Error, Result, is_retryable};
use crate::instrumentation::{SanitizationConfig, extract_operation};
use crate::rpc::{RpcResult, SpannerRpc};

/// Stream of partial results tied to a transaction.
pub type ResultStream = BoxStream<'static, Result<PartialResultSet>>;

#[derive(Debug, Default)]
struct TransactionState {
    id: Option<Bytes>,
    begin_time: Option<Instant>,
    mutations: Vec<Mutation>,
    ended: bool,
}

/// A transaction bound to a session.
pub struct Transaction {
    rpc: Arc<dyn SpannerRpc>,
    session: String,
    options: TransactionOptions,
    state: Mutex<TransactionState>,
    seqno: AtomicU64,
    attempts: AtomicU32,
    timeout: Mutex<Option<Duration>>,
    interceptor: Mutex<Option<UnboundedSender<ServiceError>>>,
}

impl Transaction {
    pub(crate) fn new(rpc: Arc<dyn SpannerRpc>, session: String, options: TransactionOptions) -> Self {
        Self {
            rpc,
            session,
            options,
            state: Mutex::new(TransactionState::default()),
            seqno: AtomicU64::new(1),
            attempts: AtomicU32::new(0),
            timeout: Mutex::new(None),
            interceptor: Mutex::new(None),
        }
    }

    /// Name of the session the transaction is bound to.
    #[must_use]
    pub fn session_name(&self) -> &str {
        &self.session
    }

    /// Transaction mode.
    #[must_use]
    pub fn options(&self) -> TransactionOptions {
        self.options
    }

    /// Whether writes are rejected.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.options.is_read_only()
    }

    /// Server-assigned id, once begun.
    #[must_use]
    pub fn id(&self) -> Option<Bytes> {
        self.state.lock().id.clone()
    }

    /// When the transaction was begun.
    #[must_use]
    pub fn begin_time(&self) -> Option<Instant> {
        self.state.lock().begin_time
    }

    /// Whether the transaction has been committed, rolled back or ended.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    /// How many times the enclosing runner has retried.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub(crate) fn set_attempts(&self, attempts: u32) {
        self.attempts.store(attempts, Ordering::Release);
    }

    /// User-configured timeout for the enclosing runner.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    /// Set the timeout reported by [`timeout`](Self::timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = Some(timeout);
    }

    /// The sequence number the next `ExecuteSql` request will carry.
    #[must_use]
    pub fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::Acquire)
    }

    fn next_seqno(&self) -> u64 {
        self.seqno.fetch_add(1, Ordering::AcqRel)
    }

    /// Continue numbering after `last`, never moving backwards.
    pub fn resume_sequence_from(&self, last: u64) {
        self.seqno.fetch_max(last, Ordering::AcqRel);
    }

    /// Mutations buffered for commit.
    #[must_use]
    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().mutations.clone()
    }

    /// Begin the transaction explicitly.
    ///
    /// Does nothing if it already has an id.
    pub async fn begin(&self) -> Result<()> {
        self.ensure_active()?;
        if self.id().is_some() {
            return Ok(());
        }

        tracing::debug!(session = %self.session, options = ?self.options, "beginning transaction");
        let result = self.rpc.begin_transaction(&self.session, &self.options).await;
        let info = self.check(result).await?;

        let mut state = self.state.lock();
        state.id = Some(info.id);
        state.begin_time = Some(Instant::now());
        Ok(())
    }

    /// Execute a query and collect its results.
    pub async fn run(&self, statement: impl Into<Statement>) -> Result<ResultSet> {
        self.ensure_active()?;
        let request = self.sql_request(statement.into());
        self.log_statement(&request);

        let result = self.rpc.execute_sql(request).await;
        let result_set = self.check(result).await?;
        if let Some(id) = &result_set.transaction_id {
            self.record_inline_begin(id.clone());
        }
        Ok(result_set)
    }

    /// Execute a DML statement and return the number of modified rows.
    pub async fn run_update(&self, statement: impl Into<Statement>) -> Result<i64> {
        if self.is_read_only() {
            return Err(Error::ReadOnly("execute DML"));
        }
        let result_set = self.run(statement).await?;
        Ok(result_set.row_count.unwrap_or(0))
    }

    /// Execute a query and stream its results.
    pub async fn run_stream(self: &Arc<Self>, statement: impl Into<Statement>) -> Result<ResultStream> {
        self.ensure_active()?;
        let request = self.sql_request(statement.into());
        self.log_statement(&request);

        let result = self.rpc.execute_streaming_sql(request).await;
        let stream = self.check(result).await?;
        Ok(self.wrap_stream(stream))
    }

    /// Read rows by key and collect them.
    pub async fn read(
        &self,
        table: &str,
        columns: &[&str],
        key_set: KeySet,
    ) -> Result<ResultSet> {
        self.ensure_active()?;
        let request = self.read_request(table, columns, key_set);
        tracing::debug!(session = %self.session, table = table, "reading rows");

        let result = self.rpc.read(request).await;
        let result_set = self.check(result).await?;
        if let Some(id) = &result_set.transaction_id {
            self.record_inline_begin(id.clone());
        }
        Ok(result_set)
    }

    /// Read rows by key as a stream.
    pub async fn read_stream(
        self: &Arc<Self>,
        table: &str,
        columns: &[&str],
        key_set: KeySet,
    ) -> Result<ResultStream> {
        self.ensure_active()?;
        let request = self.read_request(table, columns, key_set);

        let result = self.rpc.streaming_read(request).await;
        let stream = self.check(result).await?;
        Ok(self.wrap_stream(stream))
    }

    /// Buffer an insert.
    pub fn insert(&self, table: &str, columns: &[&str], values: Vec<Vec<Value>>) -> Result<()> {
        self.buffer(Mutation::Insert(write(table, columns, values)))
    }

    /// Buffer an update.
    pub fn update(&self, table: &str, columns: &[&str], values: Vec<Vec<Value>>) -> Result<()> {
        self.buffer(Mutation::Update(write(table, columns, values)))
    }

    /// Buffer an insert-or-update.
    pub fn upsert(&self, table: &str, columns: &[&str], values: Vec<Vec<Value>>) -> Result<()> {
        self.buffer(Mutation::InsertOrUpdate(write(table, columns, values)))
    }

    /// Buffer a replace.
    pub fn replace(&self, table: &str, columns: &[&str], values: Vec<Vec<Value>>) -> Result<()> {
        self.buffer(Mutation::Replace(write(table, columns, values)))
    }

    /// Buffer a delete by key.
    pub fn delete_rows(&self, table: &str, key_set: KeySet) -> Result<()> {
        self.buffer(Mutation::Delete {
            table: table.to_string(),
            key_set,
        })
    }

    /// Commit buffered mutations and end the transaction.
    ///
    /// A transaction that was never begun commits as a single-use
    /// read-write transaction.
    pub async fn commit(&self) -> Result<CommitResponse> {
        if self.is_read_only() {
            return Err(Error::ReadOnly("commit"));
        }

        let (selector, mutations) = {
            let state = self.state.lock();
            if state.ended {
                return Err(Error::TransactionEnded);
            }
            let selector = match &state.id {
                Some(id) => TransactionSelector::Id(id.clone()),
                None => TransactionSelector::SingleUse(TransactionOptions::ReadWrite),
            };
            (selector, state.mutations.clone())
        };

        tracing::debug!(
            session = %self.session,
            mutations = mutations.len(),
            "committing transaction"
        );

        let result = self
            .rpc
            .commit(CommitRequest {
                session: self.session.clone(),
                transaction: selector,
                mutations,
            })
            .await;
        self.end();
        self.check(result).await
    }

    /// Roll back and end the transaction.
    pub async fn rollback(&self) -> Result<()> {
        let id = {
            let state = self.state.lock();
            if state.ended {
                return Err(Error::TransactionEnded);
            }
            state.id.clone()
        };

        let Some(id) = id else {
            self.end();
            return Err(Error::UnknownTransaction);
        };

        tracing::debug!(session = %self.session, "rolling back transaction");
        let result = self.rpc.rollback(&self.session, &id).await;
        self.end();
        self.check(result).await
    }

    /// End the transaction locally, discarding its id and buffered
    /// mutations. Idempotent.
    pub fn end(&self) {
        let mut state = self.state.lock();
        state.ended = true;
        state.id = None;
        state.mutations.clear();
    }

    pub(crate) fn set_interceptor(&self, sender: UnboundedSender<ServiceError>) {
        *self.interceptor.lock() = Some(sender);
    }

    pub(crate) fn clear_interceptor(&self) {
        *self.interceptor.lock() = None;
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_ended() {
            return Err(Error::TransactionEnded);
        }
        Ok(())
    }

    fn buffer(&self, mutation: Mutation) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly("buffer mutations"));
        }
        let mut state = self.state.lock();
        if state.ended {
            return Err(Error::TransactionEnded);
        }
        state.mutations.push(mutation);
        Ok(())
    }

    fn selector(&self) -> TransactionSelector {
        match self.id() {
            Some(id) => TransactionSelector::Id(id),
            None => TransactionSelector::Begin(self.options),
        }
    }

    fn sql_request(&self, statement: Statement) -> ExecuteSqlRequest {
        ExecuteSqlRequest {
            session: self.session.clone(),
            transaction: self.selector(),
            statement,
            seqno: self.next_seqno(),
        }
    }

    fn read_request(&self, table: &str, columns: &[&str], key_set: KeySet) -> ReadRequest {
        ReadRequest {
            session: self.session.clone(),
            transaction: self.selector(),
            table: table.to_string(),
            index: None,
            columns: columns.iter().map(ToString::to_string).collect(),
            key_set,
            limit: None,
        }
    }

    fn log_statement(&self, request: &ExecuteSqlRequest) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                session = %self.session,
                seqno = request.seqno,
                operation = extract_operation(&request.statement.sql),
                statement = %SanitizationConfig::default().sanitize(&request.statement.sql),
                "executing statement"
            );
        }
    }

    fn record_inline_begin(&self, id: Bytes) {
        let mut state = self.state.lock();
        if state.id.is_none() && !state.ended {
            state.id = Some(id);
            state.begin_time = Some(Instant::now());
        }
    }

    /// Route a failed call: retryable errors go to the runner when one is
    /// intercepting, and the caller never resumes.
    async fn check<T>(&self, result: RpcResult<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let interceptor = self.interceptor.lock().clone();
                match interceptor {
                    Some(sender) if is_retryable(&err) => {
                        let _ = sender.send(err);
                        futures_util::future::pending().await
                    }
                    _ => Err(err.into()),
                }
            }
        }
    }

    fn wrap_stream(self: &Arc<Self>, stream: crate::rpc::PartialResultStream) -> ResultStream {
        let this = Arc::clone(self);
        stream
            .then(move |item| {
                let this = Arc::clone(&this);
                async move {
                    let chunk = this.check(item).await?;
                    if let Some(id) = &chunk.transaction_id {
                        this.record_inline_begin(id.clone());
                    }
                    Ok(chunk)
                }
            })
            .boxed()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Transaction")
            .field("session", &self.session)
            .field("options", &self.options)
            .field("id", &state.id)
            .field("ended", &state.ended)
            .field("seqno", &self.seqno())
            .finish()
    }
}

fn write(table: &str, columns: &[&str], values: Vec<Vec<Value>>) -> Write {
    Write {
        table: table.to_string(),
        columns: columns.iter().map(ToString::to_string).collect(),
        values,
    }
}
