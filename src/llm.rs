//! LLM client for SQL generation and result scoring.
//!
//! Speaks the OpenAI chat-completions wire format against any compatible
//! endpoint (`base_url` is configurable, so local inference servers work
//! unchanged). The [`ChatModel`] trait is the seam the generator and the
//! result scorer depend on; tests substitute a stub implementation.
//!
//! Retry is deliberately absent here: the orchestrator owns the retry
//! policy, and the circuit breaker in front of this client owns failure
//! accounting.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::OpenAIConfig,
    error::{QueryError, llm_http_error}
};

/// One completed chat exchange.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content:     String,
    pub tokens_used: u64
}

/// Minimal chat interface the pipeline needs from a language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run one system + user exchange and return the assistant text.
    async fn complete(&self, system: &str, user: &str) -> Result<ChatCompletion, QueryError>;
}

#[derive(Serialize)]
struct ChatRequest {
    model:       String,
    messages:    Vec<ChatMessage>,
    temperature: f32
}

#[derive(Serialize)]
struct ChatMessage {
    role:    &'static str,
    content: String
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage:   Option<ChatUsage>
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64
}

/// HTTP client for an OpenAI-compatible chat endpoint.
pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAIConfig
}

impl OpenAiClient {
    pub fn new(config: OpenAIConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            config
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, system: &str, user: &str) -> Result<ChatCompletion, QueryError> {
        let request = ChatRequest {
            model:       self.config.model.clone(),
            messages:    vec![
                ChatMessage {
                    role:    "system",
                    content: system.to_string()
                },
                ChatMessage {
                    role:    "user",
                    content: user.to_string()
                },
            ],
            temperature: 0.0
        };

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(llm_http_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(QueryError::LlmMalformed {
                message: format!("API error {}: {}", status, text)
            });
        }

        let result: ChatResponse = response.json().await.map_err(llm_http_error)?;
        let tokens_used = result.usage.unwrap_or_default().total_tokens;
        result
            .choices
            .into_iter()
            .next()
            .map(|c| ChatCompletion {
                content: c.message.content,
                tokens_used
            })
            .ok_or_else(|| QueryError::LlmMalformed {
                message: String::from("Empty response from model")
            })
    }
}
