//! Request and response data model for the `query` tool.
//!
//! These types define the wire contract of the line-delimited JSON channel:
//! one [`QueryRequest`] in, one [`QueryResponse`] out. The response always
//! carries `generated_sql` when a statement was produced, even on failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, QueryError};

/// What the caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum ReturnType {
    /// Generate SQL without executing it.
    #[serde(rename = "sql")]
    Sql,
    /// Execute the generated SQL and return rows.
    #[default]
    #[serde(rename = "result")]
    Result
}

/// A single natural-language query request.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question:    String,
    #[serde(default)]
    pub database:    Option<String>,
    #[serde(default)]
    pub return_type: ReturnType
}

/// Tabular payload of an executed query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryData {
    /// Column names in result order.
    pub columns:   Vec<String>,
    /// Rows as objects keyed by column name, in database order.
    pub rows:      Vec<serde_json::Map<String, Value>>,
    pub row_count: usize,
    /// More rows were available than `max_rows` allowed.
    pub truncated: bool
}

/// Structured error carried in a failed response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseError {
    pub code:    ErrorCode,
    pub message: String,
    pub details: Option<Value>
}

impl From<&QueryError> for ResponseError {
    fn from(err: &QueryError) -> Self {
        let details = match err {
            QueryError::InvalidParameter {
                details, ..
            } => details.clone(),
            QueryError::Db {
                sqlstate: Some(state),
                ..
            } => Some(serde_json::json!({ "sqlstate": state })),
            _ => None
        };
        Self {
            code: err.code(),
            message: err.to_string(),
            details
        }
    }
}

/// Complete response for one request.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub success:       bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data:          Option<QueryData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error:         Option<ResponseError>,
    /// Confidence score 0..=100 for the generated SQL or scored result.
    pub confidence:    u8,
    /// LLM tokens consumed across all attempts of this request.
    pub tokens_used:   u64
}

impl QueryResponse {
    /// Successful response carrying optional data.
    pub fn success(
        sql: String,
        data: Option<QueryData>,
        confidence: u8,
        tokens_used: u64
    ) -> Self {
        Self {
            success: true,
            generated_sql: Some(sql),
            data,
            error: None,
            confidence,
            tokens_used
        }
    }

    /// Failed response; keeps the last generated SQL for debugging.
    pub fn failure(err: &QueryError, generated_sql: Option<String>, tokens_used: u64) -> Self {
        Self {
            success: false,
            generated_sql,
            data: None,
            error: Some(ResponseError::from(err)),
            confidence: 0,
            tokens_used
        }
    }

    /// Failure with an explicit code, for states outside the pipeline
    /// (e.g. a request arriving before initialization completes).
    pub fn failure_with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            generated_sql: None,
            data: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
                details: None
            }),
            confidence: 0,
            tokens_used: 0
        }
    }
}
