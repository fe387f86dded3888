//! Language-model service interface and an OpenAI-compatible HTTP client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::LlmConfig;
use crate::error::{ConfigError, LlmError};
use crate::security::{SecretValue, require_env};

/// Which pipeline stage issued a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptPurpose {
    QueryGeneration,
    Summary,
    Report,
}

impl PromptPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptPurpose::QueryGeneration => "query_generation",
            PromptPurpose::Summary => "summary",
            PromptPurpose::Report => "report",
        }
    }
}

/// A structured prompt: optional system text plus user text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub purpose: PromptPurpose,
    pub system: Option<String>,
    pub user: String,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(purpose: PromptPurpose, user: impl Into<String>) -> Self {
        Self {
            purpose,
            system: None,
            user: user.into(),
            temperature: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Return the completion text for `request`.
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError>;
}

pub type DynLanguageModel = Arc<dyn LanguageModel>;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChatClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretValue>,
    default_temperature: Option<f32>,
}

impl OpenAiChatClient {
    pub fn new(config: &LlmConfig, api_key: Option<SecretValue>) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| ConfigError::invalid(format!("failed to create HTTP client: {err}")))?;

        Ok(Self {
            client,
            endpoint: chat_endpoint(&config.base_url),
            model: config.model.clone(),
            api_key,
            default_temperature: config.temperature,
        })
    }

    /// Build the client, resolving the API key from the configured variable.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = match config.api_key_env.as_deref().map(str::trim) {
            Some(var) if !var.is_empty() => Some(require_env(var)?),
            _ => None,
        };
        Self::new(config, api_key)
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatClient {
    #[instrument(name = "llm.complete", skip(self, request), fields(purpose = request.purpose.as_str()))]
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.user,
        });

        let body = ChatCompletionBody {
            model: &self.model,
            messages,
            temperature: request.temperature.or(self.default_temperature),
        };

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose());
        }

        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            return Err(LlmError::Status(status.as_u16()));
        }

        let payload: ChatCompletionResponse = response.json().await.map_err(|err| {
            if err.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Malformed(err.to_string())
            }
        })?;

        let content = payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(LlmError::EmptyCompletion);
        }

        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}

fn classify_transport(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Transport(err.to_string())
    }
}

/// Resolve the chat completions endpoint from a base URL.
fn chat_endpoint(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_resolution() {
        assert_eq!(
            chat_endpoint("https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("http://localhost:1234/"),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("http://host/v1/chat/completions"),
            "http://host/v1/chat/completions"
        );
    }

    #[test]
    fn request_body_omits_missing_temperature() {
        let body = ChatCompletionBody {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn response_without_content_decodes() {
        let payload: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(payload.choices[0].message.content.is_none());
    }

    #[test]
    fn keyless_client_builds_without_env() {
        let config = LlmConfig {
            api_key_env: None,
            ..LlmConfig::default()
        };
        assert!(OpenAiChatClient::from_config(&config).is_ok());
    }
}
