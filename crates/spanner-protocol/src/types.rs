//! Request and response shapes of the session, transaction and query RPCs.
//!
//! Values are carried as [`serde_json::Value`]; how they map onto Spanner
//! column types is the concern of the query layer, not of this crate.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A parameter or column value.
pub type Value = serde_json::Value;

/// Server-side description of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionInfo {
    /// Fully qualified session name assigned by the server.
    pub name: String,
    /// When the server created the session.
    pub create_time: Option<DateTime<Utc>>,
    /// Labels the session was created with.
    pub labels: BTreeMap<String, String>,
    /// Whether this is a multiplexed session.
    pub multiplexed: bool,
    /// Database role the session acts as.
    pub creator_role: Option<String>,
}

/// Client-supplied attributes for session creation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionTemplate {
    /// Labels applied to every created session.
    pub labels: BTreeMap<String, String>,
    /// Request a multiplexed session.
    pub multiplexed: bool,
    /// Database role for fine-grained access control.
    pub creator_role: Option<String>,
}

/// Read timestamp selection for read-only transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampBound {
    /// Read the latest committed data.
    #[default]
    Strong,
    /// Read data exactly this old.
    ExactStaleness(Duration),
    /// Read data no older than this bound.
    MaxStaleness(Duration),
    /// Read at a specific timestamp.
    ReadTimestamp(DateTime<Utc>),
}

/// Mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionOptions {
    /// Locking read-write transaction.
    #[default]
    ReadWrite,
    /// Lock-free read-only transaction.
    ReadOnly(TimestampBound),
    /// Partitioned DML.
    PartitionedDml,
}

impl TransactionOptions {
    /// Whether writes are permitted.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly(_))
    }
}

/// Which transaction a request executes in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionSelector {
    /// A temporary transaction for this request only.
    SingleUse(TransactionOptions),
    /// A previously begun transaction.
    Id(Bytes),
    /// Begin a transaction as part of this request.
    Begin(TransactionOptions),
}

/// Result of `BeginTransaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    /// Server-assigned transaction id.
    pub id: Bytes,
    /// Read timestamp for read-only transactions.
    pub read_timestamp: Option<DateTime<Utc>>,
}

/// A SQL statement with named parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    /// SQL text.
    pub sql: String,
    /// Named parameters, referenced as `@name` in the SQL.
    pub params: BTreeMap<String, Value>,
}

impl Statement {
    /// Create a statement without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: BTreeMap::new(),
        }
    }

    /// Bind a named parameter.
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

/// `ExecuteSql` / `ExecuteStreamingSql` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteSqlRequest {
    /// Session name.
    pub session: String,
    /// Transaction the statement runs in.
    pub transaction: TransactionSelector,
    /// Statement to execute.
    pub statement: Statement,
    /// Per-transaction sequence number identifying the request for
    /// idempotent replay.
    pub seqno: u64,
}

/// Set of primary keys.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeySet {
    /// Individual keys, each a list of key column values.
    pub keys: Vec<Vec<Value>>,
    /// Select every row of the table.
    pub all: bool,
}

impl KeySet {
    /// Key set covering the whole table.
    #[must_use]
    pub fn all() -> Self {
        Self {
            keys: Vec::new(),
            all: true,
        }
    }

    /// Key set from explicit keys.
    #[must_use]
    pub fn keys(keys: Vec<Vec<Value>>) -> Self {
        Self { keys, all: false }
    }
}

/// `Read` / `StreamingRead` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    /// Session name.
    pub session: String,
    /// Transaction the read runs in.
    pub transaction: TransactionSelector,
    /// Table to read from.
    pub table: String,
    /// Optional secondary index.
    pub index: Option<String>,
    /// Columns to return.
    pub columns: Vec<String>,
    /// Rows to return.
    pub key_set: KeySet,
    /// Maximum rows to return.
    pub limit: Option<u64>,
}

/// Complete result of a query or read.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    /// Column names.
    pub columns: Vec<String>,
    /// Row values in column order.
    pub rows: Vec<Vec<Value>>,
    /// Rows modified by a DML statement.
    pub row_count: Option<i64>,
    /// Transaction begun inline by this request.
    pub transaction_id: Option<Bytes>,
}

/// One chunk of a streamed result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartialResultSet {
    /// Column names; present on the first chunk only.
    pub columns: Vec<String>,
    /// Rows carried by this chunk.
    pub rows: Vec<Vec<Value>>,
    /// Rows modified by a DML statement; present on the last chunk.
    pub row_count: Option<i64>,
    /// Transaction begun inline; present on the first chunk.
    pub transaction_id: Option<Bytes>,
    /// Token for resuming the stream after this chunk.
    pub resume_token: Bytes,
}

/// Column writes for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    /// Table name.
    pub table: String,
    /// Column names.
    pub columns: Vec<String>,
    /// Rows of values in column order.
    pub values: Vec<Vec<Value>>,
}

/// A buffered write applied atomically at commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert rows; fails if any exist.
    Insert(Write),
    /// Update existing rows; fails if any are missing.
    Update(Write),
    /// Insert or update rows.
    InsertOrUpdate(Write),
    /// Delete then insert rows.
    Replace(Write),
    /// Delete rows by key.
    Delete {
        /// Table name.
        table: String,
        /// Keys to delete.
        key_set: KeySet,
    },
}

impl Mutation {
    /// Table the mutation applies to.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Insert(w) | Self::Update(w) | Self::InsertOrUpdate(w) | Self::Replace(w) => {
                &w.table
            }
            Self::Delete { table, .. } => table,
        }
    }
}

/// `Commit` request.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    /// Session name.
    pub session: String,
    /// `Id` of a begun transaction or `SingleUse` read-write.
    pub transaction: TransactionSelector,
    /// Writes to apply.
    pub mutations: Vec<Mutation>,
}

/// Result of `Commit`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitResponse {
    /// Timestamp at which the transaction committed.
    pub commit_timestamp: Option<DateTime<Utc>>,
}
