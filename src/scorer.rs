//! LLM scoring of query results against the original question.
//!
//! A second, cheaper model call judges whether the rows that came back
//! plausibly answer what was asked. Scores below the configured threshold
//! mark the attempt as a soft failure so the orchestrator can regenerate.
//! The call is guarded by the same rate-limiter scope and circuit breaker
//! as generation.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::{Map, Value};

use crate::{
    config::ValidationConfig,
    error::QueryError,
    llm::ChatModel
};

static SCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)confidence['\x22]?\s*[:=]\s*(\d{1,3})").expect("score regex"));

const SYSTEM_PROMPT: &str = "You judge whether SQL query results answer a user's question.\n\
Reply with a line `confidence: NN` (0-100) and, optionally, one short line of rationale.\n\
Score high when the columns and sample rows plausibly answer the question; score low when \
the query clearly computed something else.";

/// Outcome of one scoring call.
#[derive(Debug, Clone)]
pub struct ValidationScore {
    pub confidence:  u8,
    pub rationale:   Option<String>,
    pub tokens_used: u64
}

/// Judges result rows against the question.
pub struct ResultValidator {
    model:  Arc<dyn ChatModel>,
    config: ValidationConfig
}

impl ResultValidator {
    pub fn new(model: Arc<dyn ChatModel>, config: ValidationConfig) -> Self {
        Self {
            model,
            config
        }
    }

    pub fn min_confidence(&self) -> u8 {
        self.config.min_confidence_score
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Score `rows` (sampled down to `sample_rows`) against `question`.
    pub async fn score(
        &self,
        question: &str,
        sql: &str,
        rows: &[Map<String, Value>]
    ) -> Result<ValidationScore, QueryError> {
        let sample: Vec<&Map<String, Value>> =
            rows.iter().take(self.config.sample_rows).collect();
        let sample_json =
            serde_json::to_string_pretty(&sample).unwrap_or_else(|_| String::from("[]"));

        let user = format!(
            "Question: {}\n\nSQL:\n{}\n\nSample rows ({} of {} shown):\n{}",
            question,
            sql,
            sample.len(),
            rows.len(),
            sample_json
        );

        let completion = self.model.complete(SYSTEM_PROMPT, &user).await?;
        let confidence = SCORE_RE
            .captures(&completion.content)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .map(|n| n.min(100) as u8)
            .ok_or_else(|| QueryError::LlmMalformed {
                message: String::from("Scoring reply contained no confidence value")
            })?;

        let rationale = completion
            .content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !SCORE_RE.is_match(line))
            .map(String::from);

        Ok(ValidationScore {
            confidence,
            rationale,
            tokens_used: completion.tokens_used
        })
    }
}
