//! Read-only SQL validation.
//!
//! Nothing reaches the executor without passing this gate. Candidate SQL is
//! parsed with the PostgreSQL dialect and checked in a fixed order:
//!
//! 1. Non-empty input that parses to exactly one statement.
//! 2. Statement kind: `SELECT`, set operations over selects, CTEs whose
//!    bodies are selects, and `EXPLAIN` as far as [`ExplainPolicy`] allows.
//!    Everything else - DML, DDL, grants, utility commands - is rejected.
//! 3. Function deny-list (sleep, file I/O, admin helpers).
//! 4. Table deny-list.
//! 5. Column deny-list, on both the bare and the qualified form.
//!
//! All name comparisons are case-insensitive, and qualified names match
//! both fully-dotted and by final segment. The explain gate reads the
//! `ANALYZE` option from the AST and additionally requires the explained
//! statement to pass the same statement-kind check, so `EXPLAIN ANALYZE
//! DELETE` can never execute a write regardless of policy.

mod walk;

use std::collections::HashSet;

use sqlparser::{ast::Statement, dialect::PostgreSqlDialect, parser::Parser};
pub use walk::SqlObjects;
use walk::collect_query;

use crate::{
    config::{ExplainPolicy, SecurityConfig},
    error::{QueryError, security_violation, sql_parse_error}
};

/// Security gate for generated SQL.
pub struct SqlValidator {
    explain_policy:    ExplainPolicy,
    blocked_tables:    HashSet<String>,
    blocked_columns:   HashSet<String>,
    blocked_functions: HashSet<String>
}

impl SqlValidator {
    pub fn new(security: &SecurityConfig) -> Self {
        Self {
            explain_policy:    security.explain_policy,
            blocked_tables:    lowered(&security.blocked_tables),
            blocked_columns:   lowered(&security.blocked_columns),
            blocked_functions: lowered(&security.blocked_functions)
        }
    }

    /// Validate one candidate statement.
    ///
    /// # Errors
    ///
    /// [`QueryError::SqlParse`] for unparseable input,
    /// [`QueryError::SecurityViolation`] for anything outside the read-only
    /// allow-list.
    pub fn validate(&self, sql: &str) -> Result<(), QueryError> {
        let statement = self.parse_single(sql)?;
        self.check_statement(&statement)
    }

    /// Canonical text of the parsed statement, for logging and cache keys.
    pub fn normalize(&self, sql: &str) -> Result<String, QueryError> {
        Ok(self.parse_single(sql)?.to_string())
    }

    /// Sorted, deduplicated base-relation names referenced by `sql`.
    pub fn extract_tables(&self, sql: &str) -> Result<Vec<String>, QueryError> {
        let statement = self.parse_single(sql)?;
        let objects = statement_objects(&statement)?;
        let mut tables: Vec<String> = objects
            .tables
            .iter()
            .map(|t| t.to_string())
            .collect();
        tables.sort();
        tables.dedup();
        Ok(tables)
    }

    fn parse_single(&self, sql: &str) -> Result<Statement, QueryError> {
        if sql.trim().is_empty() {
            return Err(sql_parse_error("SQL query is empty"));
        }
        let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
            .map_err(|e| sql_parse_error(e.to_string()))?;
        match statements.len() {
            0 => Err(sql_parse_error("SQL query is empty")),
            1 => Ok(statements.remove(0)),
            _ => Err(security_violation("Multiple SQL statements are not allowed"))
        }
    }

    fn check_statement(&self, statement: &Statement) -> Result<(), QueryError> {
        match statement {
            Statement::Query(query) => {
                let mut objects = SqlObjects::default();
                collect_query(query, &mut objects)?;
                self.check_objects(&objects)
            }
            Statement::Explain {
                analyze,
                statement: inner,
                ..
            } => {
                match self.explain_policy {
                    ExplainPolicy::Disabled => {
                        return Err(security_violation("EXPLAIN statements are not allowed"));
                    }
                    ExplainPolicy::ExplainOnly if *analyze => {
                        return Err(security_violation("EXPLAIN ANALYZE is not allowed"));
                    }
                    _ => {}
                }
                // The explained statement is held to the same gate.
                self.check_statement(inner)
            }
            Statement::Insert(_) => deny("INSERT"),
            Statement::Update {
                ..
            } => deny("UPDATE"),
            Statement::Delete(_) => deny("DELETE"),
            Statement::CreateTable(_) | Statement::CreateIndex(_) => deny("CREATE"),
            Statement::Drop {
                ..
            } => deny("DROP"),
            Statement::Truncate {
                ..
            } => deny("TRUNCATE"),
            other => {
                let keyword = other
                    .to_string()
                    .split_whitespace()
                    .next()
                    .unwrap_or("UNKNOWN")
                    .to_uppercase();
                Err(security_violation(format!(
                    "Statement type '{}' is not allowed",
                    keyword
                )))
            }
        }
    }

    fn check_objects(&self, objects: &SqlObjects) -> Result<(), QueryError> {
        for function in &objects.functions {
            let name = function.to_lowercase();
            let last = name.rsplit('.').next().unwrap_or(&name);
            if self.blocked_functions.contains(name.as_str()) || self.blocked_functions.contains(last) {
                return Err(security_violation(format!(
                    "Function '{}' is not allowed",
                    last
                )));
            }
        }

        for table in &objects.tables {
            let name = table.to_lowercase();
            let last = name.rsplit('.').next().unwrap_or(&name);
            if self.blocked_tables.contains(name.as_str()) || self.blocked_tables.contains(last) {
                return Err(security_violation(format!(
                    "Access to table '{}' is blocked",
                    last
                )));
            }
        }

        for (qualifier, column) in &objects.columns {
            let name = column.to_lowercase();
            if self.blocked_columns.contains(name.as_str()) {
                return Err(security_violation(format!(
                    "Access to column '{}' is blocked",
                    name
                )));
            }
            if let Some(qualifier) = qualifier {
                let qualified = format!("{}.{}", qualifier.to_lowercase(), name);
                if self.blocked_columns.contains(&qualified) {
                    return Err(security_violation(format!(
                        "Access to column '{}' is blocked",
                        qualified
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Collect objects from a statement. Only query-shaped statements reference
/// relations this service cares about; anything else yields an empty set.
fn statement_objects(statement: &Statement) -> Result<SqlObjects, QueryError> {
    let mut objects = SqlObjects::default();
    match statement {
        Statement::Query(query) => collect_query(query, &mut objects)?,
        Statement::Explain {
            statement: inner, ..
        } => {
            return statement_objects(inner);
        }
        _ => {}
    }
    Ok(objects)
}

fn deny(keyword: &str) -> Result<(), QueryError> {
    Err(security_violation(format!(
        "Statement type '{}' is not allowed",
        keyword
    )))
}

fn lowered(values: &[String]) -> HashSet<String> {
    values.iter().map(|v| v.to_lowercase()).collect()
}
