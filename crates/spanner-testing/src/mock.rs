//! In-memory Spanner service.
//!
//! [`MockSpanner`] keeps a table of live sessions, answers every RPC of
//! [`SpannerRpc`] against it, and lets tests inject failures, latency and
//! server-side session expiry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream;
use parking_lot::Mutex;
use spanner_client::{PartialResultStream, RpcResult, SpannerRpc};
use spanner_protocol::{
    Code, CommitRequest, CommitResponse, ExecuteSqlRequest, PartialResultSet, ReadRequest,
    ResultSet, ServiceError, SessionInfo, SessionTemplate, TransactionInfo, TransactionOptions,
    TransactionSelector, Value,
};

/// RPC methods of the mock, used to script failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `CreateSession`.
    CreateSession,
    /// `BatchCreateSessions`.
    BatchCreateSessions,
    /// `DeleteSession`.
    DeleteSession,
    /// `GetSession`.
    GetSession,
    /// `BeginTransaction`.
    BeginTransaction,
    /// `Commit`.
    Commit,
    /// `Rollback`.
    Rollback,
    /// `ExecuteSql`.
    ExecuteSql,
    /// `ExecuteStreamingSql`.
    ExecuteStreamingSql,
    /// `Read`.
    Read,
    /// `StreamingRead`.
    StreamingRead,
}

#[derive(Debug, Default)]
struct MockState {
    sessions: HashMap<String, SessionInfo>,
    faults: HashMap<Method, VecDeque<ServiceError>>,
    calls: HashMap<Method, u64>,
    executed: Vec<ExecuteSqlRequest>,
    commits: Vec<CommitRequest>,
    deleted: Vec<String>,
    batch_limit: Option<u32>,
    latency: Option<Duration>,
    row_count: i64,
    rows: Vec<Vec<Value>>,
}

/// A scriptable in-memory implementation of [`SpannerRpc`].
///
/// ```rust,ignore
/// let mock = Arc::new(MockSpanner::new());
/// mock.fail_times(Method::Commit, 2, ServiceError::new(Code::Aborted, "aborted"));
/// let rpc: Arc<dyn SpannerRpc> = mock.clone();
/// ```
#[derive(Debug)]
pub struct MockSpanner {
    state: Mutex<MockState>,
    next_transaction: AtomicU64,
}

impl Default for MockSpanner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSpanner {
    /// Create an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                row_count: 1,
                ..MockState::default()
            }),
            next_transaction: AtomicU64::new(1),
        }
    }

    /// Fail the next call to `method` with `err`.
    pub fn fail_next(&self, method: Method, err: ServiceError) {
        self.fail_times(method, 1, err);
    }

    /// Fail the next `times` calls to `method` with `err`.
    pub fn fail_times(&self, method: Method, times: usize, err: ServiceError) {
        let mut state = self.state.lock();
        let queue = state.faults.entry(method).or_default();
        queue.extend(std::iter::repeat_n(err, times));
    }

    /// Drop any scripted failures for `method`.
    pub fn clear_faults(&self, method: Method) {
        self.state.lock().faults.remove(&method);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Return at most `limit` sessions per `BatchCreateSessions` call.
    pub fn set_batch_limit(&self, limit: u32) {
        self.state.lock().batch_limit = Some(limit);
    }

    /// Row count reported for DML statements.
    pub fn set_row_count(&self, row_count: i64) {
        self.state.lock().row_count = row_count;
    }

    /// Rows returned by queries and reads.
    pub fn set_rows(&self, rows: Vec<Vec<Value>>) {
        self.state.lock().rows = rows;
    }

    /// Forget a session server-side, as if it had expired.
    pub fn expire_session(&self, name: &str) -> bool {
        self.state.lock().sessions.remove(name).is_some()
    }

    /// Forget every session server-side.
    pub fn expire_all_sessions(&self) {
        self.state.lock().sessions.clear();
    }

    /// Move a session's creation time `age` into the past.
    pub fn backdate_session(&self, name: &str, age: Duration) -> bool {
        let Ok(age) = chrono::Duration::from_std(age) else {
            return false;
        };
        let mut state = self.state.lock();
        match state.sessions.get_mut(name) {
            Some(info) => {
                info.create_time = Some(Utc::now() - age);
                true
            }
            None => false,
        }
    }

    /// Number of calls made to `method`.
    #[must_use]
    pub fn calls(&self, method: Method) -> u64 {
        self.state.lock().calls.get(&method).copied().unwrap_or(0)
    }

    /// Number of sessions the server currently knows.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Whether the server knows `name`.
    #[must_use]
    pub fn has_session(&self, name: &str) -> bool {
        self.state.lock().sessions.contains_key(name)
    }

    /// Names of sessions deleted through `DeleteSession`, in order.
    #[must_use]
    pub fn deleted_sessions(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    /// Every `ExecuteSql` and `ExecuteStreamingSql` request received.
    #[must_use]
    pub fn executed_sql(&self) -> Vec<ExecuteSqlRequest> {
        self.state.lock().executed.clone()
    }

    /// Every successful `Commit` request received.
    #[must_use]
    pub fn commits(&self) -> Vec<CommitRequest> {
        self.state.lock().commits.clone()
    }

    /// Count the call, wait out the latency, then pop a scripted failure.
    async fn enter(&self, method: Method) -> RpcResult<()> {
        let latency = {
            let mut state = self.state.lock();
            *state.calls.entry(method).or_insert(0) += 1;
            state.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let fault = self
            .state
            .lock()
            .faults
            .get_mut(&method)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(err) => {
                tracing::trace!(?method, code = %err.code, "injecting failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn require_session(&self, name: &str) -> RpcResult<()> {
        if self.state.lock().sessions.contains_key(name) {
            Ok(())
        } else {
            Err(ServiceError::session_not_found(name))
        }
    }

    fn new_session(&self, database: &str, template: &SessionTemplate) -> SessionInfo {
        let info = SessionInfo {
            name: format!("{database}/sessions/{}", uuid::Uuid::new_v4().simple()),
            create_time: Some(Utc::now()),
            labels: template.labels.clone(),
            multiplexed: template.multiplexed,
            creator_role: template.creator_role.clone(),
        };
        self.state
            .lock()
            .sessions
            .insert(info.name.clone(), info.clone());
        info
    }

    fn new_transaction_id(&self) -> Bytes {
        let id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        Bytes::from(format!("txn-{id}"))
    }

    fn inline_begin(&self, selector: &TransactionSelector) -> Option<Bytes> {
        match selector {
            TransactionSelector::Begin(_) => Some(self.new_transaction_id()),
            _ => None,
        }
    }

    fn query_result(&self, request: &ExecuteSqlRequest) -> ResultSet {
        let state = self.state.lock();
        let row_count = is_dml(&request.statement.sql).then_some(state.row_count);
        ResultSet {
            columns: Vec::new(),
            rows: if row_count.is_some() {
                Vec::new()
            } else {
                state.rows.clone()
            },
            row_count,
            transaction_id: None,
        }
    }
}

fn is_dml(sql: &str) -> bool {
    let keyword = sql.split_whitespace().next().unwrap_or_default();
    ["INSERT", "UPDATE", "DELETE"]
        .iter()
        .any(|dml| keyword.eq_ignore_ascii_case(dml))
}

#[async_trait]
impl SpannerRpc for MockSpanner {
    async fn create_session(
        &self,
        database: &str,
        template: &SessionTemplate,
    ) -> RpcResult<SessionInfo> {
        self.enter(Method::CreateSession).await?;
        Ok(self.new_session(database, template))
    }

    async fn batch_create_sessions(
        &self,
        database: &str,
        template: &SessionTemplate,
        count: u32,
    ) -> RpcResult<Vec<SessionInfo>> {
        self.enter(Method::BatchCreateSessions).await?;
        let limit = self.state.lock().batch_limit;
        let count = limit.map_or(count, |limit| count.min(limit));
        Ok((0..count)
            .map(|_| self.new_session(database, template))
            .collect())
    }

    async fn delete_session(&self, name: &str) -> RpcResult<()> {
        self.enter(Method::DeleteSession).await?;
        let mut state = self.state.lock();
        state.deleted.push(name.to_string());
        match state.sessions.remove(name) {
            Some(_) => Ok(()),
            None => Err(ServiceError::session_not_found(name)),
        }
    }

    async fn get_session(&self, name: &str) -> RpcResult<SessionInfo> {
        self.enter(Method::GetSession).await?;
        self.state
            .lock()
            .sessions
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::session_not_found(name))
    }

    async fn begin_transaction(
        &self,
        session: &str,
        options: &TransactionOptions,
    ) -> RpcResult<TransactionInfo> {
        self.enter(Method::BeginTransaction).await?;
        self.require_session(session)?;
        Ok(TransactionInfo {
            id: self.new_transaction_id(),
            read_timestamp: options.is_read_only().then(Utc::now),
        })
    }

    async fn commit(&self, request: CommitRequest) -> RpcResult<CommitResponse> {
        self.enter(Method::Commit).await?;
        self.require_session(&request.session)?;
        if let TransactionSelector::SingleUse(options) = &request.transaction {
            if options.is_read_only() {
                return Err(ServiceError::new(
                    Code::InvalidArgument,
                    "Cannot commit a read-only transaction",
                ));
            }
        }
        self.state.lock().commits.push(request);
        Ok(CommitResponse {
            commit_timestamp: Some(Utc::now()),
        })
    }

    async fn rollback(&self, session: &str, _transaction_id: &Bytes) -> RpcResult<()> {
        self.enter(Method::Rollback).await?;
        self.require_session(session)
    }

    async fn execute_sql(&self, request: ExecuteSqlRequest) -> RpcResult<ResultSet> {
        self.state.lock().executed.push(request.clone());
        self.enter(Method::ExecuteSql).await?;
        self.require_session(&request.session)?;

        let mut result = self.query_result(&request);
        result.transaction_id = self.inline_begin(&request.transaction);
        Ok(result)
    }

    async fn execute_streaming_sql(
        &self,
        request: ExecuteSqlRequest,
    ) -> RpcResult<PartialResultStream> {
        self.state.lock().executed.push(request.clone());
        self.enter(Method::ExecuteStreamingSql).await?;
        self.require_session(&request.session)?;

        let result = self.query_result(&request);
        let chunk = PartialResultSet {
            columns: result.columns,
            rows: result.rows,
            row_count: result.row_count,
            transaction_id: self.inline_begin(&request.transaction),
            resume_token: Bytes::new(),
        };
        Ok(Box::pin(stream::iter([Ok(chunk)])))
    }

    async fn read(&self, request: ReadRequest) -> RpcResult<ResultSet> {
        self.enter(Method::Read).await?;
        self.require_session(&request.session)?;
        Ok(ResultSet {
            columns: request.columns,
            rows: self.state.lock().rows.clone(),
            row_count: None,
            transaction_id: self.inline_begin(&request.transaction),
        })
    }

    async fn streaming_read(&self, request: ReadRequest) -> RpcResult<PartialResultStream> {
        self.enter(Method::StreamingRead).await?;
        self.require_session(&request.session)?;
        let chunk = PartialResultSet {
            columns: request.columns,
            rows: self.state.lock().rows.clone(),
            row_count: None,
            transaction_id: self.inline_begin(&request.transaction),
            resume_token: Bytes::new(),
        };
        Ok(Box::pin(stream::iter([Ok(chunk)])))
    }
}
