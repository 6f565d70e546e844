// Reasoning Service Providers
// OpenAI-compatible chat completions and Anthropic messages

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Instant;
use thiserror::Error;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_DEFAULT_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Missing content in response")]
    MissingContent,
    #[error("JSON parse error: {0}")]
    JsonError(String),
    #[error("API key not configured")]
    MissingApiKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub model: String,
}

impl ProviderSpec {
    pub fn is_anthropic(&self) -> bool {
        matches!(self.name.as_str(), "anthropic" | "claude")
    }

    /// Configured model, or the provider's default when none was given.
    pub fn model_or_default(&self) -> &str {
        if !self.model.is_empty() {
            &self.model
        } else if self.is_anthropic() {
            ANTHROPIC_DEFAULT_MODEL
        } else {
            OPENAI_DEFAULT_MODEL
        }
    }
}

/// `"anthropic:claude-3-5-haiku-latest"` or a bare `"openai"`.
pub fn parse_provider(spec: &str) -> ProviderSpec {
    let parts: Vec<&str> = spec.splitn(2, ':').collect();
    if parts.len() == 2 {
        ProviderSpec {
            name: parts[0].trim().to_lowercase(),
            model: parts[1].trim().to_string(),
        }
    } else {
        ProviderSpec {
            name: spec.trim().to_lowercase(),
            model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    pub content: String,
    pub latency_ms: i64,
}

#[derive(Clone)]
pub struct ProviderClient {
    client: Client,
    openai_url: String,
    anthropic_url: String,
}

impl Default for ProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderClient {
    /// Endpoints come from `OPENAI_API_URL` / `ANTHROPIC_API_URL`, falling back to the
    /// public APIs.
    pub fn new() -> Self {
        let openai_url =
            env::var("OPENAI_API_URL").unwrap_or_else(|_| OPENAI_DEFAULT_URL.to_string());
        let anthropic_url =
            env::var("ANTHROPIC_API_URL").unwrap_or_else(|_| ANTHROPIC_DEFAULT_URL.to_string());
        Self::with_urls(openai_url, anthropic_url)
    }

    pub fn with_urls(openai_url: impl Into<String>, anthropic_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(80))
            .build()
            .unwrap_or_default();

        Self {
            client,
            openai_url: openai_url.into(),
            anthropic_url: anthropic_url.into(),
        }
    }

    /// Overrides the endpoint of the API family `spec` routes to.
    pub fn with_endpoint(mut self, spec: &ProviderSpec, url: impl Into<String>) -> Self {
        if spec.is_anthropic() {
            self.anthropic_url = url.into();
        } else {
            self.openai_url = url.into();
        }
        self
    }

    /// Routes to the API matching `spec.name`.
    pub async fn call(
        &self,
        spec: &ProviderSpec,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<ChatResult, ProviderError> {
        if spec.is_anthropic() {
            self.call_anthropic(spec.model_or_default(), api_key, system, user, max_tokens)
                .await
        } else {
            self.call_openai_compatible(spec.model_or_default(), api_key, system, user, max_tokens)
                .await
        }
    }

    pub async fn call_anthropic(
        &self,
        model: &str,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<ChatResult, ProviderError> {
        #[derive(Serialize)]
        struct AnthropicRequest {
            model: String,
            max_tokens: u32,
            #[serde(skip_serializing_if = "String::is_empty")]
            system: String,
            messages: Vec<ChatMessage>,
        }

        #[derive(Deserialize)]
        struct AnthropicResponse {
            content: Option<Vec<AnthropicContent>>,
        }

        #[derive(Deserialize)]
        struct AnthropicContent {
            text: Option<String>,
        }

        let request = AnthropicRequest {
            model: model.to_string(),
            max_tokens,
            system: system.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: user.to_string(),
            }],
        };

        let start = Instant::now();

        let response = self
            .client
            .post(&self.anthropic_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let latency_ms = start.elapsed().as_millis() as i64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let data: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        let content = data
            .content
            .and_then(|c| c.into_iter().find_map(|block| block.text))
            .filter(|t| !t.trim().is_empty())
            .ok_or(ProviderError::MissingContent)?;

        Ok(ChatResult { content, latency_ms })
    }

    /// Chat completions with `response_format = json_object`.
    pub async fn call_openai_compatible(
        &self,
        model: &str,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<ChatResult, ProviderError> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens,
            temperature: 0.0,
            response_format: Some(ResponseFormat {
                r#type: "json_object".to_string(),
            }),
        };

        let start = Instant::now();

        let response = self
            .client
            .post(&self.openai_url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let latency_ms = start.elapsed().as_millis() as i64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        let content = data
            .choices
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.clone())
            .filter(|t| !t.trim().is_empty())
            .ok_or(ProviderError::MissingContent)?;

        Ok(ChatResult { content, latency_ms })
    }
}

fn env_key_names(provider: &str) -> Vec<&'static str> {
    match provider {
        "anthropic" | "claude" => vec!["ANTHROPIC_API_KEY", "CLAUSEGUARD_ANTHROPIC_API_KEY"],
        "openai" => vec!["OPENAI_API_KEY", "CLAUSEGUARD_OPENAI_API_KEY"],
        _ => vec![],
    }
}

/// Get API key from environment or config file
pub fn get_api_key(provider: &str) -> Option<String> {
    for key in env_key_names(provider) {
        if let Ok(val) = env::var(key) {
            let v = val.trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }

    if let Some(config_dir) = super::ConfigStore::default_config_dir() {
        let store = super::ConfigStore::new(config_dir);
        if let Ok(Some(key)) = store.get_api_key(provider) {
            return Some(key);
        }
    }

    None
}
