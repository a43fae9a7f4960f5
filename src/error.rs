use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or querying the task graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("node '{0}' is already registered")]
    DuplicateNode(String),

    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("unknown job '{0}'")]
    UnknownJob(String),
}

/// Errors returned by external data sources and the language model.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{source_name} returned status {status}")]
    Status { source_name: String, status: u16 },

    #[error("{source_name} rate limited the request")]
    RateLimited {
        source_name: String,
        retry_after: Option<Duration>,
    },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no data returned for {0}")]
    Empty(String),

    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
}

impl SourceError {
    /// Whether a retry with backoff has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::RateLimited { .. } | SourceError::Timeout(_) => true,
            SourceError::Status { status, .. } => *status >= 500 || *status == 429,
            SourceError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SourceError::Malformed(_) | SourceError::Empty(_) | SourceError::MissingCredential(_) => {
                false
            }
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            SourceError::RateLimited { .. } | SourceError::Status { status: 429, .. }
        )
    }
}

/// Errors surfaced by the storage layer. A storage error always aborts the
/// batch that triggered it.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation not supported by this warehouse: {0}")]
    Unsupported(&'static str),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("rejected query: {0}")]
    RejectedQuery(String),
}

/// Validation failures of structured model output.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("response is not valid JSON: {0}")]
    Unparseable(String),

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' has invalid value '{value}'")]
    InvalidEnum { field: String, value: String },

    #[error("expected {expected} items, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("field '{field}' out of range: {value}")]
    OutOfRange { field: String, value: f64 },

    #[error("'{field}' must sum to {expected}, got {actual}")]
    SumMismatch {
        field: String,
        expected: f64,
        actual: f64,
    },
}

/// Invalid cron expressions and timezones.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

/// Errors from the run-lock backends.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error: {0}")]
    Pool(String),

    #[error("lock '{0}' still held after waiting {1:?}")]
    WaitExpired(String, Duration),
}

impl From<LockError> for NodeError {
    fn from(e: LockError) -> Self {
        NodeError::Transient(e.to_string())
    }
}

/// Node-level failure. Only failures that block the whole node end up here;
/// per-item failures are counted in reports instead.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("precondition missing: {0}")]
    PreconditionMissing(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    /// Stable label used in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::PreconditionMissing(_) => "precondition_missing",
            NodeError::Storage(_) => "storage",
            NodeError::Transient(_) => "transient",
            NodeError::Malformed(_) => "malformed",
            NodeError::Configuration(_) => "configuration",
            NodeError::Timeout(_) => "timeout",
            NodeError::Cancelled => "cancelled",
        }
    }
}

impl From<SourceError> for NodeError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Malformed(msg) => NodeError::Malformed(msg),
            SourceError::MissingCredential(name) => {
                NodeError::Configuration(format!("missing credential {}", name))
            }
            other => NodeError::Transient(other.to_string()),
        }
    }
}

impl From<DecodeError> for NodeError {
    fn from(e: DecodeError) -> Self {
        NodeError::Malformed(e.to_string())
    }
}
