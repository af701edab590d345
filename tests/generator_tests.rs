use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use pg_nlq::{
    error::QueryError,
    generator::{AttemptFailure, SqlGenerator, schema_fingerprint},
    llm::{ChatCompletion, ChatModel},
    schema::{ColumnSummary, SchemaSummary, TableSummary, content_hash}
};

struct StubModel {
    reply:   String,
    prompts: Mutex<Vec<String>>
}

impl StubModel {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply:   reply.to_string(),
            prompts: Mutex::new(Vec::new())
        })
    }
}

#[async_trait]
impl ChatModel for StubModel {
    async fn complete(&self, _system: &str, user: &str) -> Result<ChatCompletion, QueryError> {
        self.prompts.lock().unwrap().push(user.to_string());
        Ok(ChatCompletion {
            content:     self.reply.clone(),
            tokens_used: 42
        })
    }
}

fn table(name: &str, columns: &[&str]) -> TableSummary {
    TableSummary {
        schema: String::from("public"),
        name: name.to_string(),
        columns: columns
            .iter()
            .map(|c| ColumnSummary {
                name:           c.to_string(),
                data_type:      String::from("text"),
                nullable:       true,
                is_primary_key: false
            })
            .collect(),
        row_estimate: 10,
        sample_row_count: 10
    }
}

fn summary_with(tables: Vec<TableSummary>) -> SchemaSummary {
    let mut map = IndexMap::new();
    for t in tables {
        map.insert(t.qualified_name(), t);
    }
    let hash = content_hash(&map, &[]);
    SchemaSummary {
        database: String::from("app"),
        tables: map,
        foreign_keys: Vec::new(),
        loaded_at: Utc::now(),
        content_hash: hash
    }
}

#[tokio::test]
async fn generates_sql_with_confidence() {
    let model = StubModel::new("```sql\nSELECT COUNT(*) FROM users;\n-- confidence: 88\n```");
    let generator = SqlGenerator::new(model.clone());
    let schema = summary_with(vec![table("users", &["id", "email"])]);

    let generated = generator
        .generate("How many users are there?", &schema, &[])
        .await
        .unwrap();
    assert_eq!(generated.sql, "SELECT COUNT(*) FROM users;");
    assert_eq!(generated.confidence, 88);
    assert_eq!(generated.tokens_used, 42);
}

#[tokio::test]
async fn prompt_contains_schema_and_question() {
    let model = StubModel::new("SELECT 1");
    let generator = SqlGenerator::new(model.clone());
    let schema = summary_with(vec![table("users", &["id", "email"])]);

    generator.generate("count users", &schema, &[]).await.unwrap();
    let prompts = model.prompts.lock().unwrap();
    assert!(prompts[0].contains("Table: public.users"));
    assert!(prompts[0].contains("Question: count users"));
}

#[tokio::test]
async fn prompt_carries_failure_history() {
    let model = StubModel::new("SELECT 1");
    let generator = SqlGenerator::new(model.clone());
    let schema = summary_with(vec![table("users", &["id"])]);
    let history = vec![AttemptFailure {
        previous_sql:   String::from("DELETE FROM users"),
        failure_reason: String::from("Statement type 'DELETE' is not allowed")
    }];

    generator.generate("count users", &schema, &history).await.unwrap();
    let prompts = model.prompts.lock().unwrap();
    assert!(prompts[0].contains("DELETE FROM users"));
    assert!(prompts[0].contains("not allowed"));
}

#[test]
fn small_schema_ships_in_full() {
    let schema = summary_with(vec![
        table("users", &["id"]),
        table("orders", &["id", "user_id"]),
    ]);
    let fingerprint = schema_fingerprint("anything at all", &schema, 20);
    assert!(fingerprint.contains("public.users"));
    assert!(fingerprint.contains("public.orders"));
}

#[test]
fn large_schema_keeps_relevant_tables() {
    let mut tables: Vec<TableSummary> =
        (0..30).map(|i| table(&format!("misc_{}", i), &["id"])).collect();
    tables.push(table("orders", &["id", "total", "revenue"]));
    tables.push(table("products", &["id", "name"]));
    let schema = summary_with(tables);

    let fingerprint = schema_fingerprint("top products by revenue", &schema, 5);
    assert!(fingerprint.contains("public.orders"));
    assert!(fingerprint.contains("public.products"));
    // The cap holds: only five tables rendered.
    assert_eq!(fingerprint.matches("Table: ").count(), 5);
}
