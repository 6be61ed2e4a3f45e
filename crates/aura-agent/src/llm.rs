use crate::error::AgentError;
use async_trait::async_trait;
use aura_types::ChatMessage;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const OPENAI_API_URL: &str = "https://api.openai.com";

/// Produces the next assistant message for a conversation.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, AgentError>;
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_base_url() -> String {
    OPENAI_API_URL.to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            base_url: default_base_url(),
            temperature: None,
        }
    }
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI chat completions.
#[derive(Debug, Clone)]
pub struct OpenAiLlm {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiLlm {
    pub fn new(config: OpenAiConfig) -> Result<Self, AgentError> {
        if config.api_key.is_empty() {
            return Err(AgentError::Config("OPENAI_API_KEY is not set".to_string()));
        }
        if config.model.is_empty() {
            return Err(AgentError::Config("llm.model must not be empty".to_string()));
        }
        if let Some(t) = config.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(AgentError::Config(
                    "llm.temperature must be between 0.0 and 2.0".to_string(),
                ));
            }
        }
        let client = crate::build_http_client()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }
}

#[async_trait]
impl LanguageModel for OpenAiLlm {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, AgentError> {
        if messages.is_empty() {
            return Err(AgentError::Llm("no messages to complete".to_string()));
        }

        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let request = CompletionRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::Llm(format!(
                "OpenAI returned {}: {}",
                status, detail
            )));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("Invalid OpenAI response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| AgentError::Llm("OpenAI returned no content".to_string()))
    }
}
