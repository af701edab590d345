//! Error taxonomy for the query pipeline.
//!
//! Every failure the service can report on the wire is a [`QueryError`]
//! variant with a stable [`ErrorCode`]. Lower layers return typed errors
//! with `?`; only the orchestrator converts them into a response object.
//!
//! # Error Classes
//!
//! | Class | Codes | Orchestrator policy |
//! |-------|-------|---------------------|
//! | Client | `INVALID_PARAMETER`, `INVALID_REQUEST`, `NO_SUCH_DATABASE`, `DATABASE_REQUIRED` | returned immediately |
//! | Policy | `SECURITY_VIOLATION`, `SQL_PARSE` | retried with history when configured |
//! | Upstream | `LLM_TIMEOUT`, `LLM_MALFORMED`, `UPSTREAM_UNAVAILABLE` | feed the circuit breaker |
//! | Database | `DB_ERROR`, `TIMEOUT`, `CANCELED` | transient classes retried once |
//! | Resource | `RATE_LIMITED` | surfaced without retry |

use serde::Serialize;
use thiserror::Error;

/// Stable wire-level error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "SERVER_NOT_INITIALIZED")]
    ServerNotInitialized,
    #[serde(rename = "INVALID_PARAMETER")]
    InvalidParameter,
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "UPSTREAM_UNAVAILABLE")]
    UpstreamUnavailable,
    #[serde(rename = "LLM_TIMEOUT")]
    LlmTimeout,
    #[serde(rename = "LLM_MALFORMED")]
    LlmMalformed,
    #[serde(rename = "SECURITY_VIOLATION")]
    SecurityViolation,
    #[serde(rename = "SQL_PARSE")]
    SqlParse,
    #[serde(rename = "NO_SUCH_DATABASE")]
    NoSuchDatabase,
    #[serde(rename = "DATABASE_REQUIRED")]
    DatabaseRequired,
    #[serde(rename = "DB_ERROR")]
    DbError,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "CANCELED")]
    Canceled
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerNotInitialized => "SERVER_NOT_INITIALIZED",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::RateLimited => "RATE_LIMITED",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::LlmTimeout => "LLM_TIMEOUT",
            Self::LlmMalformed => "LLM_MALFORMED",
            Self::SecurityViolation => "SECURITY_VIOLATION",
            Self::SqlParse => "SQL_PARSE",
            Self::NoSuchDatabase => "NO_SUCH_DATABASE",
            Self::DatabaseRequired => "DATABASE_REQUIRED",
            Self::DbError => "DB_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Canceled => "CANCELED"
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure raised anywhere in the query pipeline.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("Invalid parameter: {message}")]
    InvalidParameter {
        message: String,
        details: Option<serde_json::Value>
    },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Too many concurrent {scope} requests")]
    RateLimited { scope: &'static str },

    #[error("LLM circuit breaker is open")]
    UpstreamUnavailable,

    #[error("LLM request timed out")]
    LlmTimeout,

    #[error("LLM response could not be used: {message}")]
    LlmMalformed { message: String },

    #[error("Security violation: {reason}")]
    SecurityViolation { reason: String },

    #[error("SQL parse error: {message}")]
    SqlParse { message: String },

    #[error("Unknown database '{name}'")]
    NoSuchDatabase { name: String },

    #[error("Multiple databases are configured; specify one")]
    DatabaseRequired,

    #[error("Database error: {message}")]
    Db {
        message:  String,
        sqlstate: Option<String>
    },

    #[error("Query exceeded the {seconds}s execution limit")]
    Timeout { seconds: u64 },

    #[error("Query was canceled")]
    Canceled
}

impl QueryError {
    /// Stable code reported for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::UpstreamUnavailable => ErrorCode::UpstreamUnavailable,
            Self::LlmTimeout => ErrorCode::LlmTimeout,
            Self::LlmMalformed { .. } => ErrorCode::LlmMalformed,
            Self::SecurityViolation { .. } => ErrorCode::SecurityViolation,
            Self::SqlParse { .. } => ErrorCode::SqlParse,
            Self::NoSuchDatabase { .. } => ErrorCode::NoSuchDatabase,
            Self::DatabaseRequired => ErrorCode::DatabaseRequired,
            Self::Db { .. } => ErrorCode::DbError,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Canceled => ErrorCode::Canceled
        }
    }

    /// Whether the orchestrator may regenerate SQL after this failure,
    /// feeding it back into the prompt history.
    pub fn is_retryable_policy(&self) -> bool {
        matches!(
            self,
            Self::SecurityViolation { .. } | Self::SqlParse { .. }
        )
    }

    /// Transient database classes worth another generation attempt.
    ///
    /// Connection failures (SQLSTATE class 08), resource exhaustion (53300,
    /// 57P03) and statement timeouts qualify; constraint or semantic errors
    /// do not.
    pub fn is_retryable_database(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Db {
                sqlstate: Some(state),
                ..
            } => state.starts_with("08") || state == "53300" || state == "57P03",
            Self::Db {
                sqlstate: None,
                message
            } => {
                let msg = message.to_lowercase();
                msg.contains("connection") || msg.contains("timed out")
            }
            _ => false
        }
    }

    /// Failures of the LLM dependency that count against its breaker.
    pub fn feeds_breaker(&self) -> bool {
        matches!(self, Self::LlmTimeout | Self::LlmMalformed { .. })
    }
}

/// Fatal initialization failure. Surfaces as process exit code 1.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to create connection pool for '{database}': {message}")]
    Pool {
        database: String,
        message:  String
    },

    #[error("Failed to bind metrics listener on port {port}: {message}")]
    Metrics {
        port:    u16,
        message: String
    }
}

/// Create a security violation error.
pub fn security_violation(reason: impl Into<String>) -> QueryError {
    QueryError::SecurityViolation {
        reason: reason.into()
    }
}

/// Create a SQL parse error.
pub fn sql_parse_error(message: impl Into<String>) -> QueryError {
    QueryError::SqlParse {
        message: message.into()
    }
}

/// Map a reqwest failure from an LLM call into the taxonomy.
pub fn llm_http_error(err: reqwest::Error) -> QueryError {
    if err.is_timeout() {
        QueryError::LlmTimeout
    } else {
        QueryError::LlmMalformed {
            message: if err.is_connect() {
                format!("Connection failed: {}", err)
            } else if err.is_status() {
                format!("HTTP error {}: {}", err.status().unwrap_or_default(), err)
            } else {
                err.to_string()
            }
        }
    }
}

/// Map a tokio-postgres failure into the taxonomy.
///
/// SQLSTATE 57014 is raised both by `statement_timeout` expiry and by an
/// explicit cancel request; the executor distinguishes the two by whether
/// its own deadline elapsed.
pub fn db_error(err: &tokio_postgres::Error, timeout_secs: u64) -> QueryError {
    let sqlstate = err.code().map(|c| c.code().to_string());
    match sqlstate.as_deref() {
        Some("57014") => QueryError::Timeout {
            seconds: timeout_secs
        },
        _ => QueryError::Db {
            message: err.to_string(),
            sqlstate
        }
    }
}
