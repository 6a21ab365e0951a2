//! The RPC surface the session runtime consumes.
//!
//! Transport, authentication and wire encoding live behind this trait. A
//! gRPC stub implements it in production; `spanner-testing` provides an
//! in-memory implementation.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use spanner_protocol::{
    CommitRequest, CommitResponse, ExecuteSqlRequest, PartialResultSet, ReadRequest, ResultSet,
    ServiceError, SessionInfo, SessionTemplate, TransactionInfo, TransactionOptions,
};

/// Result of a single RPC.
pub type RpcResult<T> = std::result::Result<T, ServiceError>;

/// Stream of partial results from a streaming RPC.
pub type PartialResultStream = BoxStream<'static, RpcResult<PartialResultSet>>;

/// Cloud Spanner data-plane RPCs.
#[async_trait]
pub trait SpannerRpc: Send + Sync + 'static {
    /// `CreateSession`.
    async fn create_session(
        &self,
        database: &str,
        template: &SessionTemplate,
    ) -> RpcResult<SessionInfo>;

    /// `BatchCreateSessions`. May return fewer sessions than requested.
    async fn batch_create_sessions(
        &self,
        database: &str,
        template: &SessionTemplate,
        count: u32,
    ) -> RpcResult<Vec<SessionInfo>>;

    /// `DeleteSession`.
    async fn delete_session(&self, name: &str) -> RpcResult<()>;

    /// `GetSession`.
    async fn get_session(&self, name: &str) -> RpcResult<SessionInfo>;

    /// `BeginTransaction`.
    async fn begin_transaction(
        &self,
        session: &str,
        options: &TransactionOptions,
    ) -> RpcResult<TransactionInfo>;

    /// `Commit`.
    async fn commit(&self, request: CommitRequest) -> RpcResult<CommitResponse>;

    /// `Rollback`.
    async fn rollback(&self, session: &str, transaction_id: &Bytes) -> RpcResult<()>;

    /// `ExecuteSql`.
    async fn execute_sql(&self, request: ExecuteSqlRequest) -> RpcResult<ResultSet>;

    /// `ExecuteStreamingSql`.
    async fn execute_streaming_sql(
        &self,
        request: ExecuteSqlRequest,
    ) -> RpcResult<PartialResultStream>;

    /// `Read`.
    async fn read(&self, request: ReadRequest) -> RpcResult<ResultSet>;

    /// `StreamingRead`.
    async fn streaming_read(&self, request: ReadRequest) -> RpcResult<PartialResultStream>;
}
