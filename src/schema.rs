//! Database schema summaries.
//!
//! A [`SchemaSummary`] is the compact, immutable digest of one database's
//! catalog that gets rendered into LLM prompts: tables with ordered columns,
//! primary keys, foreign-key edges and row estimates. Loading reads the
//! system catalog inside a single transaction so the digest is consistent,
//! filters everything on the security block-lists, and fingerprints the
//! result with a content hash so refreshes can detect "nothing changed".
//!
//! Foreign keys form cycles in real schemas; each edge is stored exactly
//! once and endpoints are resolved by table name at read time.

use std::hash::{DefaultHasher, Hash, Hasher};

use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use indexmap::IndexMap;

use crate::{
    config::SecurityConfig,
    error::{QueryError, db_error}
};

/// Upper bound for the per-table sample-row count probe.
const SAMPLE_ROW_CAP: i64 = 1000;

/// Column metadata in catalog order.
#[derive(Debug, Clone, Hash)]
pub struct ColumnSummary {
    pub name:           String,
    pub data_type:      String,
    pub nullable:       bool,
    pub is_primary_key: bool
}

/// One table (or view) with its ordered columns.
#[derive(Debug, Clone, Hash)]
pub struct TableSummary {
    pub schema:           String,
    pub name:             String,
    pub columns:          Vec<ColumnSummary>,
    /// Planner estimate from `pg_class.reltuples`; -1 when never analyzed.
    pub row_estimate:     i64,
    /// Exact count capped at 1000, probed at load time.
    pub sample_row_count: i64
}

impl TableSummary {
    /// Schema-qualified name used as the summary key.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Render this table for an LLM prompt.
    pub fn render(&self, out: &mut String) {
        out.push_str(&format!(
            "Table: {} (~{} rows)\n",
            self.qualified_name(),
            if self.row_estimate >= 0 {
                self.row_estimate
            } else {
                self.sample_row_count
            }
        ));
        for col in &self.columns {
            let nullable = if col.nullable { "NULL" } else { "NOT NULL" };
            let primary = if col.is_primary_key { " PRIMARY KEY" } else { "" };
            out.push_str(&format!(
                "  - {} {} {}{}\n",
                col.name, col.data_type, nullable, primary
            ));
        }
    }
}

/// Directed foreign-key edge between two summarized tables.
#[derive(Debug, Clone, Hash)]
pub struct ForeignKeyEdge {
    pub from_table:  String,
    pub from_column: String,
    pub to_table:    String,
    pub to_column:   String
}

/// Immutable digest of one database's catalog.
#[derive(Debug, Clone)]
pub struct SchemaSummary {
    pub database:     String,
    /// Keyed by schema-qualified table name, in catalog order.
    pub tables:       IndexMap<String, TableSummary>,
    pub foreign_keys: Vec<ForeignKeyEdge>,
    pub loaded_at:    DateTime<Utc>,
    pub content_hash: u64
}

impl SchemaSummary {
    /// Render the full summary for an LLM prompt.
    pub fn to_prompt(&self) -> String {
        let mut out = String::from("Database Schema:\n\n");
        for table in self.tables.values() {
            table.render(&mut out);
            out.push('\n');
        }
        render_foreign_keys(&mut out, &self.foreign_keys);
        out
    }

    /// Render only the named tables, with the FK edges joining them.
    pub fn render_subset(&self, names: &[&str]) -> String {
        let mut out = String::from("Database Schema:\n\n");
        for name in names {
            if let Some(table) = self.tables.get(*name) {
                table.render(&mut out);
                out.push('\n');
            }
        }
        let edges: Vec<ForeignKeyEdge> = self
            .foreign_keys
            .iter()
            .filter(|fk| {
                names.contains(&fk.from_table.as_str()) && names.contains(&fk.to_table.as_str())
            })
            .cloned()
            .collect();
        render_foreign_keys(&mut out, &edges);
        out
    }
}

fn render_foreign_keys(out: &mut String, edges: &[ForeignKeyEdge]) {
    if edges.is_empty() {
        return;
    }
    out.push_str("Foreign keys:\n");
    for fk in edges {
        out.push_str(&format!(
            "  - {}.{} -> {}.{}\n",
            fk.from_table, fk.from_column, fk.to_table, fk.to_column
        ));
    }
}

/// Hash the structural content of a summary, ignoring load time.
pub fn content_hash(
    tables: &IndexMap<String, TableSummary>,
    foreign_keys: &[ForeignKeyEdge]
) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (name, table) in tables {
        name.hash(&mut hasher);
        table.hash(&mut hasher);
    }
    foreign_keys.hash(&mut hasher);
    hasher.finish()
}

/// Case-insensitive membership test against a block-list, matching both the
/// bare and the schema-qualified form of a table name.
fn table_blocked(blocked: &[String], schema: &str, name: &str) -> bool {
    let bare = name.to_lowercase();
    let qualified = format!("{}.{}", schema.to_lowercase(), bare);
    blocked
        .iter()
        .any(|b| b.eq_ignore_ascii_case(&bare) || b.eq_ignore_ascii_case(&qualified))
}

fn column_blocked(blocked: &[String], table: &str, column: &str) -> bool {
    let bare = column.to_lowercase();
    let qualified = format!("{}.{}", table.to_lowercase(), bare);
    blocked
        .iter()
        .any(|b| b.eq_ignore_ascii_case(&bare) || b.eq_ignore_ascii_case(&qualified))
}

/// Load a fresh summary from the live catalog.
///
/// All catalog reads run inside one transaction so the digest reflects a
/// single snapshot. Tables and columns on the block-lists never enter the
/// summary; foreign-key edges with a filtered endpoint are dropped.
pub async fn load_schema(
    database: &str,
    pool: &Pool,
    security: &SecurityConfig
) -> Result<SchemaSummary, QueryError> {
    let timeout = security.max_execution_time;
    let mut client = pool.get().await.map_err(|e| QueryError::Db {
        message:  format!("Failed to acquire connection: {}", e),
        sqlstate: None
    })?;
    let tx = client
        .transaction()
        .await
        .map_err(|e| db_error(&e, timeout))?;

    let mut tables: IndexMap<String, TableSummary> = IndexMap::new();

    let table_rows = tx
        .query(
            r"
            SELECT n.nspname, c.relname, c.reltuples::bigint
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p', 'v', 'm')
              AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
            ORDER BY n.nspname, c.relname
            ",
            &[]
        )
        .await
        .map_err(|e| db_error(&e, timeout))?;

    for row in &table_rows {
        let schema: String = row.get(0);
        let name: String = row.get(1);
        let row_estimate: i64 = row.get(2);
        if table_blocked(&security.blocked_tables, &schema, &name) {
            continue;
        }
        let table = TableSummary {
            schema,
            name,
            columns: Vec::new(),
            row_estimate,
            sample_row_count: 0
        };
        tables.insert(table.qualified_name(), table);
    }

    let column_rows = tx
        .query(
            r"
            SELECT table_schema, table_name, column_name, data_type,
                   is_nullable = 'YES'
            FROM information_schema.columns
            WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
            ORDER BY table_schema, table_name, ordinal_position
            ",
            &[]
        )
        .await
        .map_err(|e| db_error(&e, timeout))?;

    for row in &column_rows {
        let schema: String = row.get(0);
        let table_name: String = row.get(1);
        let column_name: String = row.get(2);
        let data_type: String = row.get(3);
        let nullable: bool = row.get(4);
        let key = format!("{}.{}", schema, table_name);
        let Some(table) = tables.get_mut(&key) else {
            continue;
        };
        if column_blocked(&security.blocked_columns, &table_name, &column_name) {
            continue;
        }
        table.columns.push(ColumnSummary {
            name: column_name,
            data_type,
            nullable,
            is_primary_key: false
        });
    }

    let pk_rows = tx
        .query(
            r"
            SELECT tc.table_schema, tc.table_name, kcu.column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON kcu.constraint_name = tc.constraint_name
             AND kcu.table_schema = tc.table_schema
            WHERE tc.constraint_type = 'PRIMARY KEY'
            ",
            &[]
        )
        .await
        .map_err(|e| db_error(&e, timeout))?;

    for row in &pk_rows {
        let schema: String = row.get(0);
        let table_name: String = row.get(1);
        let column_name: String = row.get(2);
        if let Some(table) = tables.get_mut(&format!("{}.{}", schema, table_name))
            && let Some(col) = table.columns.iter_mut().find(|c| c.name == column_name)
        {
            col.is_primary_key = true;
        }
    }

    let fk_rows = tx
        .query(
            r"
            SELECT tc.table_schema, tc.table_name, kcu.column_name,
                   ccu.table_schema, ccu.table_name, ccu.column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON kcu.constraint_name = tc.constraint_name
             AND kcu.table_schema = tc.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name
             AND ccu.table_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
            ",
            &[]
        )
        .await
        .map_err(|e| db_error(&e, timeout))?;

    let mut foreign_keys = Vec::with_capacity(fk_rows.len());
    for row in &fk_rows {
        let from_schema: String = row.get(0);
        let from_name: String = row.get(1);
        let from_column: String = row.get(2);
        let to_schema: String = row.get(3);
        let to_name: String = row.get(4);
        let to_column: String = row.get(5);
        let from_table = format!("{}.{}", from_schema, from_name);
        let to_table = format!("{}.{}", to_schema, to_name);
        // Edges whose endpoints were filtered out are dropped with them.
        if !tables.contains_key(&from_table) || !tables.contains_key(&to_table) {
            continue;
        }
        foreign_keys.push(ForeignKeyEdge {
            from_table,
            from_column,
            to_table,
            to_column
        });
    }

    tx.commit().await.map_err(|e| db_error(&e, timeout))?;

    // Probes run outside the snapshot transaction: a failed count (revoked
    // grants, dropped relation) must not poison the catalog reads.
    for table in tables.values_mut() {
        let probe = format!(
            "SELECT count(*) FROM (SELECT 1 FROM {} LIMIT {}) s",
            quote_qualified(&table.schema, &table.name),
            SAMPLE_ROW_CAP
        );
        match client.query_one(&probe, &[]).await {
            Ok(row) => table.sample_row_count = row.get(0),
            Err(e) => {
                tracing::debug!(table = %table.qualified_name(), error = %e, "sample count failed");
            }
        }
    }

    let hash = content_hash(&tables, &foreign_keys);
    tracing::info!(
        database = %database,
        tables = tables.len(),
        foreign_keys = foreign_keys.len(),
        "schema loaded"
    );

    Ok(SchemaSummary {
        database: database.to_string(),
        tables,
        foreign_keys,
        loaded_at: Utc::now(),
        content_hash: hash
    })
}

fn quote_qualified(schema: &str, name: &str) -> String {
    format!(
        "\"{}\".\"{}\"",
        schema.replace('"', "\"\""),
        name.replace('"', "\"\"")
    )
}
