//! Bounded execution of validated statements.
//!
//! Every statement runs inside a freshly acquired pooled connection, in a
//! read-only transaction with a per-statement `statement_timeout`. Rows are
//! streamed and capped at `max_rows`: the executor reads one row past the
//! cap to learn whether truncation happened, then stops consuming. The
//! transaction commits (it made no writes, so the commit is empty) and the
//! connection returns to the pool on every exit path.
//!
//! Value decoding maps each column by its PostgreSQL type name to a JSON
//! value, with a UTF-8 fallback for exotic types such as enums. `NUMERIC`
//! is decoded from its binary wire form into a string so aggregates keep
//! their full precision.

use std::time::{Duration, Instant};

use deadpool_postgres::Pool;
use futures::{TryStreamExt, pin_mut};
use serde_json::{Map, Value};
use tokio_postgres::{Row, types::FromSql};

use crate::{
    config::SecurityConfig,
    error::{QueryError, db_error},
    types::QueryData
};

/// Slack added to the client-side guard over the server-side timeout.
const GUARD_SLACK: Duration = Duration::from_secs(5);

/// Result of one bounded execution.
#[derive(Debug)]
pub struct ExecutionResult {
    pub data:        QueryData,
    pub duration_ms: u64
}

/// Executes validated SQL under the configured resource bounds.
pub struct SqlExecutor {
    security: SecurityConfig
}

impl SqlExecutor {
    pub fn new(security: SecurityConfig) -> Self {
        Self {
            security
        }
    }

    /// Run `sql` against `pool` and collect up to `max_rows` rows.
    ///
    /// # Errors
    ///
    /// `Timeout` when either the server-side `statement_timeout` or the
    /// client-side guard elapses; `DB_ERROR` for everything else the
    /// database reports.
    pub async fn execute(&self, sql: &str, pool: &Pool) -> Result<ExecutionResult, QueryError> {
        let timeout_secs = self.security.max_execution_time;
        let guard = Duration::from_secs(timeout_secs) + GUARD_SLACK;
        match tokio::time::timeout(guard, self.execute_inner(sql, pool)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout {
                seconds: timeout_secs
            })
        }
    }

    async fn execute_inner(&self, sql: &str, pool: &Pool) -> Result<ExecutionResult, QueryError> {
        let timeout_secs = self.security.max_execution_time;
        let started = Instant::now();

        let mut client = pool.get().await.map_err(|e| QueryError::Db {
            message:  format!("Failed to acquire connection: {}", e),
            sqlstate: None
        })?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| db_error(&e, timeout_secs))?;

        let mut setup = format!(
            "SET TRANSACTION READ ONLY; SET LOCAL statement_timeout = {}",
            timeout_secs * 1000
        );
        if let Some(role) = &self.security.readonly_role {
            setup.push_str(&format!("; SET LOCAL ROLE {}", quote_ident(role)));
        }
        if let Some(path) = &self.security.safe_search_path {
            setup.push_str(&format!(
                "; SET LOCAL search_path = {}",
                quote_literal(path)
            ));
        }
        tx.batch_execute(&setup)
            .await
            .map_err(|e| db_error(&e, timeout_secs))?;

        let statement = tx
            .prepare(sql)
            .await
            .map_err(|e| db_error(&e, timeout_secs))?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let max_rows = self.security.max_rows;
        let mut rows: Vec<Map<String, Value>> = Vec::new();
        let mut truncated = false;
        {
            let stream = tx
                .query_raw(&statement, std::iter::empty::<i32>())
                .await
                .map_err(|e| db_error(&e, timeout_secs))?;
            pin_mut!(stream);
            while let Some(row) = stream
                .try_next()
                .await
                .map_err(|e| db_error(&e, timeout_secs))?
            {
                if rows.len() == max_rows {
                    truncated = true;
                    break;
                }
                rows.push(row_to_json(&row, &columns));
            }
        }

        tx.commit().await.map_err(|e| db_error(&e, timeout_secs))?;

        let duration = started.elapsed();
        tracing::debug!(
            rows = rows.len(),
            truncated,
            duration_ms = duration.as_millis() as u64,
            "statement executed"
        );

        let row_count = rows.len();
        Ok(ExecutionResult {
            data: QueryData {
                columns,
                rows,
                row_count,
                truncated
            },
            duration_ms: duration.as_millis() as u64
        })
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Convert one row into an object keyed by column name.
fn row_to_json(row: &Row, columns: &[String]) -> Map<String, Value> {
    let mut object = Map::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        object.insert(name.clone(), column_to_json(row, idx));
    }
    object
}

/// Decode a single column by its PostgreSQL type name.
fn column_to_json(row: &Row, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_().name();
    match type_name {
        "bool" => opt(row.try_get::<_, Option<bool>>(idx), Value::Bool),
        "int2" => opt(row.try_get::<_, Option<i16>>(idx), |v| Value::from(v)),
        "int4" => opt(row.try_get::<_, Option<i32>>(idx), |v| Value::from(v)),
        "int8" => opt(row.try_get::<_, Option<i64>>(idx), |v| Value::from(v)),
        "float4" => opt(row.try_get::<_, Option<f32>>(idx), |v| Value::from(v)),
        "float8" => opt(row.try_get::<_, Option<f64>>(idx), |v| Value::from(v)),
        "numeric" => opt(row.try_get::<_, Option<PgNumericString>>(idx), |v| {
            Value::String(v.0)
        }),
        "text" | "varchar" | "bpchar" | "char" | "name" => {
            opt(row.try_get::<_, Option<String>>(idx), Value::String)
        }
        "uuid" => opt(row.try_get::<_, Option<uuid::Uuid>>(idx), |v| {
            Value::String(v.to_string())
        }),
        "json" | "jsonb" => opt(row.try_get::<_, Option<Value>>(idx), |v| v),
        "date" => opt(row.try_get::<_, Option<chrono::NaiveDate>>(idx), |v| {
            Value::String(v.to_string())
        }),
        "time" => opt(row.try_get::<_, Option<chrono::NaiveTime>>(idx), |v| {
            Value::String(v.to_string())
        }),
        "timestamp" => opt(
            row.try_get::<_, Option<chrono::NaiveDateTime>>(idx),
            |v| Value::String(v.to_string())
        ),
        "timestamptz" => opt(
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx),
            |v| Value::String(v.to_rfc3339())
        ),
        "_text" | "_varchar" => opt(row.try_get::<_, Option<Vec<String>>>(idx), |arr| {
            Value::Array(arr.into_iter().map(Value::String).collect())
        }),
        "_int4" => opt(row.try_get::<_, Option<Vec<i32>>>(idx), |arr| {
            Value::Array(arr.into_iter().map(Value::from).collect())
        }),
        "_int8" => opt(row.try_get::<_, Option<Vec<i64>>>(idx), |arr| {
            Value::Array(arr.into_iter().map(Value::from).collect())
        }),
        // Enums and other extension types: decode the raw payload as UTF-8.
        _ => opt(row.try_get::<_, Option<PgFallbackString>>(idx), |v| {
            Value::String(v.0)
        })
    }
}

fn opt<T>(
    result: Result<Option<T>, tokio_postgres::Error>,
    convert: impl FnOnce(T) -> Value
) -> Value {
    match result {
        Ok(Some(v)) => convert(v),
        _ => Value::Null
    }
}

/// `NUMERIC` decoded from its base-10000 binary wire format into a string.
struct PgNumericString(String);

impl PgNumericString {
    fn parse(raw: &[u8]) -> Result<String, Box<dyn std::error::Error + Sync + Send>> {
        if raw.len() < 8 {
            return Err("numeric payload too short".into());
        }
        let ndigits = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        let weight = i16::from_be_bytes([raw[2], raw[3]]) as i32;
        let sign = u16::from_be_bytes([raw[4], raw[5]]);
        let dscale = u16::from_be_bytes([raw[6], raw[7]]) as usize;

        if sign == 0xC000 {
            return Ok(String::from("NaN"));
        }
        if raw.len() < 8 + ndigits * 2 {
            return Err("numeric payload truncated".into());
        }

        let mut digits = Vec::with_capacity(ndigits);
        for i in 0..ndigits {
            digits.push(u16::from_be_bytes([raw[8 + i * 2], raw[9 + i * 2]]));
        }

        let mut integer = String::new();
        for pos in 0..=weight.max(-1) {
            let digit = digits.get(pos as usize).copied().unwrap_or(0);
            if integer.is_empty() {
                integer.push_str(&digit.to_string());
            } else {
                integer.push_str(&format!("{:04}", digit));
            }
        }
        if integer.is_empty() {
            integer.push('0');
        }

        let mut fraction = String::new();
        if dscale > 0 {
            let mut pos = weight + 1;
            while fraction.len() < dscale {
                let digit = if pos >= 0 {
                    digits.get(pos as usize).copied().unwrap_or(0)
                } else {
                    0
                };
                fraction.push_str(&format!("{:04}", digit));
                pos += 1;
            }
            fraction.truncate(dscale);
        }

        let mut out = String::new();
        if sign == 0x4000 && (integer != "0" || !fraction.is_empty()) {
            out.push('-');
        }
        out.push_str(integer.trim_start_matches('0'));
        if out.is_empty() || out == "-" {
            out.push('0');
        }
        if !fraction.is_empty() {
            out.push('.');
            out.push_str(&fraction);
        }
        Ok(out)
    }
}

impl<'a> FromSql<'a> for PgNumericString {
    fn from_sql(
        _: &tokio_postgres::types::Type,
        raw: &'a [u8]
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(Self::parse(raw)?))
    }

    fn accepts(ty: &tokio_postgres::types::Type) -> bool {
        *ty == tokio_postgres::types::Type::NUMERIC
    }
}

/// Raw UTF-8 fallback accepting any type.
struct PgFallbackString(String);

impl<'a> FromSql<'a> for PgFallbackString {
    fn from_sql(
        _: &tokio_postgres::types::Type,
        raw: &'a [u8]
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(String::from_utf8(raw.to_vec())?))
    }

    fn accepts(_: &tokio_postgres::types::Type) -> bool {
        true
    }
}
