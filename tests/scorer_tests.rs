use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pg_nlq::{
    config::ValidationConfig,
    error::{ErrorCode, QueryError},
    llm::{ChatCompletion, ChatModel},
    scorer::ResultValidator
};
use serde_json::{Map, Value, json};

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
            tokens_used: 7
        })
    }
}

fn row(id: i64) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(String::from("id"), json!(id));
    map
}

#[tokio::test]
async fn parses_confidence_and_rationale() {
    let model = StubModel::new("confidence: 85\nThe count matches the question.");
    let scorer = ResultValidator::new(model, ValidationConfig::default());

    let score = scorer
        .score("how many users?", "SELECT count(*) FROM users", &[row(1)])
        .await
        .unwrap();
    assert_eq!(score.confidence, 85);
    assert_eq!(
        score.rationale.as_deref(),
        Some("The count matches the question.")
    );
    assert_eq!(score.tokens_used, 7);
}

#[tokio::test]
async fn missing_confidence_is_malformed() {
    let model = StubModel::new("looks fine to me");
    let scorer = ResultValidator::new(model, ValidationConfig::default());

    let err = scorer
        .score("q", "SELECT 1", &[row(1)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::LlmMalformed);
}

#[tokio::test]
async fn sample_is_capped_at_configured_rows() {
    let model = StubModel::new("confidence: 70");
    let config = ValidationConfig {
        sample_rows: 2,
        ..Default::default()
    };
    let scorer = ResultValidator::new(model.clone(), config);

    let rows: Vec<_> = (0..10).map(row).collect();
    scorer.score("q", "SELECT id FROM t", &rows).await.unwrap();

    let prompts = model.prompts.lock().unwrap();
    assert!(prompts[0].contains("2 of 10 shown"));
}

#[tokio::test]
async fn threshold_comes_from_config() {
    let model = StubModel::new("confidence: 70");
    let config = ValidationConfig {
        min_confidence_score: 80,
        ..Default::default()
    };
    let scorer = ResultValidator::new(model, config);
    assert_eq!(scorer.min_confidence(), 80);
    assert!(scorer.enabled());
}
