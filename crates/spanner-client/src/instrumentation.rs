//! Tracing and OpenTelemetry instrumentation for session operations.
//!
//! Structured `tracing` events are always emitted. When the `otel` feature is
//! enabled, session creation also produces OpenTelemetry spans and the pool
//! reports gauges and counters through [`SessionMetrics`].
//!
//! ## Semantic Conventions
//!
//! - `db.system`: "spanner"
//! - `db.name`: Database path
//! - `db.statement`: SQL statement (sanitized)
//! - `db.operation`: Statement type (SELECT, INSERT, etc.)

#[cfg(feature = "otel")]
use opentelemetry::{
    KeyValue, global,
    trace::{Span, SpanKind, Status, Tracer},
};
use spanner_protocol::ServiceError;

/// Database system identifier.
pub const DB_SYSTEM: &str = "spanner";

/// Span names for session and transaction operations.
pub mod span_names {
    /// Batch session creation.
    pub const BATCH_CREATE_SESSIONS: &str = "spanner.batch_create_sessions";
    /// Single session creation.
    pub const CREATE_SESSION: &str = "spanner.create_session";
    /// Multiplexed session creation.
    pub const CREATE_MULTIPLEXED_SESSION: &str = "spanner.create_multiplexed_session";
    /// Session deletion.
    pub const DELETE_SESSION: &str = "spanner.delete_session";
    /// Keep-alive ping.
    pub const KEEP_ALIVE: &str = "spanner.keep_alive";
    /// Running a transaction through the retry runner.
    pub const RUN_TRANSACTION: &str = "spanner.run_transaction";
}

/// Attribute keys.
pub mod attributes {
    /// Database system type.
    pub const DB_SYSTEM: &str = "db.system";
    /// Database path.
    pub const DB_NAME: &str = "db.name";
    /// SQL statement (may be sanitized).
    pub const DB_STATEMENT: &str = "db.statement";
    /// Database operation type.
    pub const DB_OPERATION: &str = "db.operation";
    /// Number of sessions requested.
    pub const SESSIONS_REQUESTED: &str = "spanner.sessions.requested";
    /// Number of sessions returned.
    pub const SESSIONS_RETURNED: &str = "spanner.sessions.returned";
    /// Whether the session is multiplexed.
    pub const SESSION_MULTIPLEXED: &str = "spanner.session.multiplexed";
    /// Error type.
    pub const ERROR_TYPE: &str = "error.type";
}

/// Configuration for SQL statement sanitization.
#[derive(Debug, Clone)]
pub struct SanitizationConfig {
    /// Whether to sanitize SQL statements.
    pub enabled: bool,
    /// Maximum length of statement to record.
    pub max_length: usize,
    /// Placeholder to use for sanitized values.
    pub placeholder: String,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_length: 2048,
            placeholder: "?".to_string(),
        }
    }
}

impl SanitizationConfig {
    /// A configuration that records statements verbatim.
    #[must_use]
    pub fn no_sanitization() -> Self {
        Self {
            enabled: false,
            max_length: usize::MAX,
            placeholder: String::new(),
        }
    }

    /// Sanitize a SQL statement according to the configuration.
    #[must_use]
    pub fn sanitize(&self, sql: &str) -> String {
        if !self.enabled {
            return truncate_string(sql, self.max_length);
        }
        truncate_string(&sanitize_sql(sql, &self.placeholder), self.max_length)
    }
}

/// Replace string and numeric literals with `placeholder`.
///
/// Query parameters (`@name`) are left untouched.
fn sanitize_sql(sql: &str, placeholder: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == '\\' {
                chars.next();
            } else if c == q {
                quote = None;
                result.push_str(placeholder);
            }
            continue;
        }

        if c == '\'' || c == '"' {
            quote = Some(c);
            continue;
        }

        if c.is_ascii_digit()
            && !result.ends_with(|ch: char| ch.is_alphanumeric() || ch == '_' || ch == '@')
        {
            while chars
                .peek()
                .is_some_and(|ch| ch.is_ascii_digit() || *ch == '.')
            {
                chars.next();
            }
            result.push_str(placeholder);
            continue;
        }

        result.push(c);
    }

    if quote.is_some() {
        result.push_str(placeholder);
    }

    result
}

/// Truncate to at most `max_len` bytes on a character boundary.
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let limit = max_len.saturating_sub(3);
    let end = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= limit)
        .last()
        .unwrap_or(0);
    format!("{}...", &s[..end])
}

/// Extract the operation type from a SQL statement.
#[must_use]
pub fn extract_operation(sql: &str) -> &'static str {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    match keyword.as_str() {
        "SELECT" | "WITH" => "SELECT",
        "INSERT" => "INSERT",
        "UPDATE" => "UPDATE",
        "DELETE" => "DELETE",
        "CALL" => "CALL",
        "CREATE" => "CREATE",
        "ALTER" => "ALTER",
        "DROP" => "DROP",
        _ => "OTHER",
    }
}

/// Records one session creation request: a `BatchCreateSessions` call, a
/// single `CreateSession`, or a multiplexed session creation.
pub struct SessionCreationSpan {
    database: String,
    requested: u32,
    multiplexed: bool,
    start: std::time::Instant,
    #[cfg(feature = "otel")]
    span: global::BoxedSpan,
}

impl SessionCreationSpan {
    /// Start recording a request for `requested` sessions.
    #[must_use]
    pub fn start(database: &str, requested: u32, multiplexed: bool) -> Self {
        if multiplexed {
            tracing::info!(database = database, "Creating Multiplexed Session");
        } else if requested > 1 {
            tracing::debug!(database = database, "Requesting {requested} sessions");
        } else {
            tracing::debug!(database = database, "Creating {requested} sessions");
        }

        Self {
            database: database.to_string(),
            requested,
            multiplexed,
            start: std::time::Instant::now(),
            #[cfg(feature = "otel")]
            span: Self::otel_span(database, requested, multiplexed),
        }
    }

    #[cfg(feature = "otel")]
    fn otel_span(database: &str, requested: u32, multiplexed: bool) -> global::BoxedSpan {
        let tracer = global::tracer("spanner-client");
        let name = if multiplexed {
            span_names::CREATE_MULTIPLEXED_SESSION
        } else if requested > 1 {
            span_names::BATCH_CREATE_SESSIONS
        } else {
            span_names::CREATE_SESSION
        };

        tracer
            .span_builder(name)
            .with_kind(SpanKind::Client)
            .with_attributes(vec![
                KeyValue::new(attributes::DB_SYSTEM, DB_SYSTEM),
                KeyValue::new(attributes::DB_NAME, database.to_string()),
                KeyValue::new(attributes::SESSIONS_REQUESTED, i64::from(requested)),
                KeyValue::new(attributes::SESSION_MULTIPLEXED, multiplexed),
            ])
            .start(&tracer)
    }

    /// The request failed.
    #[cfg_attr(not(feature = "otel"), allow(unused_mut))]
    pub fn fail(mut self, error: &ServiceError) {
        tracing::warn!(
            database = %self.database,
            requested = self.requested,
            multiplexed = self.multiplexed,
            code = %error.code,
            elapsed_ms = self.start.elapsed().as_millis() as u64,
            error = %error,
            "session creation failed"
        );

        #[cfg(feature = "otel")]
        {
            self.span.set_attribute(KeyValue::new(
                attributes::ERROR_TYPE,
                error.code.as_str(),
            ));
            self.span.set_status(Status::error(error.to_string()));
            self.span.end();
        }
    }

    /// The request returned `returned` sessions.
    #[cfg_attr(not(feature = "otel"), allow(unused_mut))]
    pub fn returned(mut self, returned: usize) {
        if self.multiplexed {
            tracing::info!(
                database = %self.database,
                elapsed_ms = self.start.elapsed().as_millis() as u64,
                "Created Multiplexed Session"
            );
        } else {
            tracing::debug!(
                database = %self.database,
                elapsed_ms = self.start.elapsed().as_millis() as u64,
                "Requested for {} sessions returned {returned}",
                self.requested
            );
        }

        #[cfg(feature = "otel")]
        {
            self.span.set_attribute(KeyValue::new(
                attributes::SESSIONS_RETURNED,
                i64::try_from(returned).unwrap_or(i64::MAX),
            ));
            self.span.set_status(Status::Ok);
            self.span.end();
        }
        #[cfg(not(feature = "otel"))]
        let _ = returned;
    }
}

impl std::fmt::Debug for SessionCreationSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCreationSpan")
            .field("database", &self.database)
            .field("requested", &self.requested)
            .field("multiplexed", &self.multiplexed)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// OpenTelemetry Metrics Support
// =============================================================================

/// Metric names.
pub mod metric_names {
    /// Gauge: sessions checked out of the pool.
    pub const SESSIONS_IN_USE: &str = "spanner.client.sessions.in_use";
    /// Gauge: idle sessions held by the pool.
    pub const SESSIONS_IDLE: &str = "spanner.client.sessions.idle";
    /// Gauge: maximum sessions the pool may hold.
    pub const SESSIONS_MAX: &str = "spanner.client.sessions.max";
    /// Counter: sessions created.
    pub const SESSIONS_CREATED_TOTAL: &str = "spanner.client.sessions.created.total";
    /// Counter: sessions destroyed.
    pub const SESSIONS_DESTROYED_TOTAL: &str = "spanner.client.sessions.destroyed.total";
    /// Histogram: time spent waiting to acquire a session.
    pub const SESSIONS_WAIT_TIME: &str = "spanner.client.sessions.wait_time";
}

/// Session pool metrics collector.
#[cfg(feature = "otel")]
pub struct SessionMetrics {
    in_use: opentelemetry::metrics::Gauge<u64>,
    idle: opentelemetry::metrics::Gauge<u64>,
    max: opentelemetry::metrics::Gauge<u64>,
    created_total: opentelemetry::metrics::Counter<u64>,
    destroyed_total: opentelemetry::metrics::Counter<u64>,
    wait_time: opentelemetry::metrics::Histogram<f64>,
    base_attributes: Vec<KeyValue>,
}

#[cfg(feature = "otel")]
impl SessionMetrics {
    /// Create a collector labelled with `database`.
    pub fn new(database: &str) -> Self {
        let meter = global::meter("spanner-client");

        let in_use = meter
            .u64_gauge(metric_names::SESSIONS_IN_USE)
            .with_description("Number of sessions currently checked out")
            .with_unit("sessions")
            .build();

        let idle = meter
            .u64_gauge(metric_names::SESSIONS_IDLE)
            .with_description("Number of idle sessions in the pool")
            .with_unit("sessions")
            .build();

        let max = meter
            .u64_gauge(metric_names::SESSIONS_MAX)
            .with_description("Maximum number of sessions allowed")
            .with_unit("sessions")
            .build();

        let created_total = meter
            .u64_counter(metric_names::SESSIONS_CREATED_TOTAL)
            .with_description("Total number of sessions created")
            .with_unit("sessions")
            .build();

        let destroyed_total = meter
            .u64_counter(metric_names::SESSIONS_DESTROYED_TOTAL)
            .with_description("Total number of sessions destroyed")
            .with_unit("sessions")
            .build();

        let wait_time = meter
            .f64_histogram(metric_names::SESSIONS_WAIT_TIME)
            .with_description("Time spent waiting for a session")
            .with_unit("s")
            .build();

        Self {
            in_use,
            idle,
            max,
            created_total,
            destroyed_total,
            wait_time,
            base_attributes: vec![
                KeyValue::new(attributes::DB_SYSTEM, DB_SYSTEM),
                KeyValue::new(attributes::DB_NAME, database.to_string()),
            ],
        }
    }

    /// Record pool occupancy.
    pub fn record_pool_status(&self, in_use: u64, idle: u64, max: u64) {
        self.in_use.record(in_use, &self.base_attributes);
        self.idle.record(idle, &self.base_attributes);
        self.max.record(max, &self.base_attributes);
    }

    /// Record `count` sessions created.
    pub fn record_sessions_created(&self, count: u64) {
        self.created_total.add(count, &self.base_attributes);
    }

    /// Record a session destroyed.
    pub fn record_session_destroyed(&self) {
        self.destroyed_total.add(1, &self.base_attributes);
    }

    /// Record time spent waiting for a session.
    pub fn record_acquire_wait(&self, duration_seconds: f64) {
        self.wait_time.record(duration_seconds, &self.base_attributes);
    }
}

#[cfg(feature = "otel")]
impl std::fmt::Debug for SessionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMetrics").finish_non_exhaustive()
    }
}

/// No-op metrics collector when the otel feature is disabled.
#[cfg(not(feature = "otel"))]
#[derive(Debug, Clone, Default)]
pub struct SessionMetrics;

#[cfg(not(feature = "otel"))]
impl SessionMetrics {
    /// Create a no-op collector.
    #[must_use]
    pub fn new(_database: &str) -> Self {
        Self
    }

    /// Record pool occupancy (no-op).
    pub fn record_pool_status(&self, _in_use: u64, _idle: u64, _max: u64) {}

    /// Record sessions created (no-op).
    pub fn record_sessions_created(&self, _count: u64) {}

    /// Record a session destroyed (no-op).
    pub fn record_session_destroyed(&self) {}

    /// Record acquire wait time (no-op).
    pub fn record_acquire_wait(&self, _duration_seconds: f64) {}
}
