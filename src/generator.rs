//! SQL generation from natural-language questions.
//!
//! The generator assembles a prompt from three parts: a fixed system
//! instruction pinning the dialect and the read-only contract, a schema
//! fingerprint holding only the tables relevant to the question, and the
//! failure history of earlier attempts so the model can correct itself.
//! The model's reply is parsed back into a single SQL statement plus a
//! self-reported confidence score.
//!
//! Relevance is a plain bag-of-words overlap between question words and
//! table/column names. Small databases skip the heuristic and ship the
//! whole summary.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::{
    error::QueryError,
    llm::ChatModel,
    schema::SchemaSummary
};

/// Tables included in the fingerprint when the heuristic kicks in.
const DEFAULT_MAX_TABLES: usize = 20;

/// Confidence assumed when the model omits its marker.
const DEFAULT_CONFIDENCE: u8 = 75;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:sql)?\s*(.*?)```").expect("fence regex")
});

static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*--\s*confidence:\s*(\d{1,3})\s*$").expect("confidence regex")
});

const SYSTEM_PROMPT: &str = "You are a PostgreSQL query writer. Translate the user's question \
into exactly one read-only SQL statement for the schema provided.\n\
Rules:\n\
- Output a single SELECT statement (CTEs and set operations over SELECTs are fine).\n\
- Never write INSERT, UPDATE, DELETE, DDL, or any statement that modifies state.\n\
- Use only tables and columns from the schema.\n\
- Output the SQL only, no prose, optionally inside a ```sql fence.\n\
- After the statement, add a final line `-- confidence: NN` where NN is 0-100, \
your confidence that the query answers the question.";

/// A previously failed attempt, fed back into the next prompt.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub previous_sql:   String,
    pub failure_reason: String
}

/// Parsed output of one generation call.
#[derive(Debug, Clone)]
pub struct GeneratedSql {
    pub sql:         String,
    pub confidence:  u8,
    pub tokens_used: u64
}

/// Prompts a language model and parses SQL out of its reply.
pub struct SqlGenerator {
    model:      Arc<dyn ChatModel>,
    max_tables: usize
}

impl SqlGenerator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            max_tables: DEFAULT_MAX_TABLES
        }
    }

    /// Generate a candidate statement for `question`.
    ///
    /// # Errors
    ///
    /// `LlmTimeout` / `LlmMalformed` from the underlying call, or
    /// `LlmMalformed` when the reply contains no usable statement.
    pub async fn generate(
        &self,
        question: &str,
        schema: &SchemaSummary,
        history: &[AttemptFailure]
    ) -> Result<GeneratedSql, QueryError> {
        let fingerprint = schema_fingerprint(question, schema, self.max_tables);
        let mut user = format!("{}\nQuestion: {}\n", fingerprint, question);
        if !history.is_empty() {
            user.push_str("\nEarlier attempts failed; do not repeat these mistakes:\n");
            for failure in history {
                user.push_str(&format!(
                    "- SQL: {}\n  Failure: {}\n",
                    failure.previous_sql.trim(),
                    failure.failure_reason
                ));
            }
        }

        let completion = self.model.complete(SYSTEM_PROMPT, &user).await?;
        let (sql, confidence) = parse_response(&completion.content)?;
        Ok(GeneratedSql {
            sql,
            confidence,
            tokens_used: completion.tokens_used
        })
    }
}

/// Render the subset of `schema` most relevant to `question`.
///
/// Databases at or under `max_tables` tables always ship the full summary.
pub fn schema_fingerprint(question: &str, schema: &SchemaSummary, max_tables: usize) -> String {
    if schema.tables.len() <= max_tables {
        return schema.to_prompt();
    }

    let words = question_words(question);
    let mut scored: Vec<(i64, usize, &str)> = schema
        .tables
        .iter()
        .enumerate()
        .map(|(idx, (name, table))| {
            let mut score = 0i64;
            let table_name = table.name.to_lowercase();
            for word in &words {
                if table_name.contains(word.as_str()) {
                    score += 3;
                }
                for col in &table.columns {
                    if col.name.to_lowercase().contains(word.as_str()) {
                        score += 1;
                    }
                }
            }
            (score, idx, name.as_str())
        })
        .collect();

    // Highest score first; catalog order breaks ties.
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    let selected: Vec<&str> = scored.iter().take(max_tables).map(|(_, _, n)| *n).collect();
    schema.render_subset(&selected)
}

fn question_words(question: &str) -> Vec<String> {
    question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() > 2)
        .map(String::from)
        .collect()
}

/// Extract `(sql, confidence)` from a model reply.
fn parse_response(content: &str) -> Result<(String, u8), QueryError> {
    let body = match FENCE_RE.captures(content) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(content),
        None => content
    };

    let confidence = CONFIDENCE_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .map(|n| n.min(100) as u8)
        .unwrap_or(DEFAULT_CONFIDENCE);

    let sql = CONFIDENCE_RE.replace_all(body, "").trim().to_string();
    if sql.is_empty() {
        return Err(QueryError::LlmMalformed {
            message: String::from("Reply contained no SQL statement")
        });
    }
    Ok((sql, confidence))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_reply_with_confidence() {
        let reply = "```sql\nSELECT COUNT(*) FROM users;\n-- confidence: 92\n```";
        let (sql, confidence) = parse_response(reply).unwrap();
        assert_eq!(sql, "SELECT COUNT(*) FROM users;");
        assert_eq!(confidence, 92);
    }

    #[test]
    fn parses_bare_reply_without_marker() {
        let (sql, confidence) = parse_response("SELECT 1").unwrap();
        assert_eq!(sql, "SELECT 1");
        assert_eq!(confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn clamps_overrange_confidence() {
        let reply = "SELECT 1\n-- confidence: 250";
        let (_, confidence) = parse_response(reply).unwrap();
        assert_eq!(confidence, 100);
    }

    #[test]
    fn rejects_empty_reply() {
        assert!(parse_response("```sql\n```").is_err());
    }
}
