//! OpenAI-compatible chat completion provider.
//!
//! Talks to any endpoint implementing `POST {base_url}/chat/completions`
//! (OpenAI, Azure-style gateways, vLLM, LiteLLM).
//!
//! # Example
//!
//! ```ignore
//! use sia_models::auth::CredentialStore;
//! use sia_models::providers::OpenAiProvider;
//!
//! let key = CredentialStore::new("sia").with_env_fallback().get("openai")?;
//! let provider = OpenAiProvider::new(key);
//! let provider = OpenAiProvider::new(key).with_base_url("http://localhost:8000/v1");
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::ApiKey;

/// Default OpenAI API base URL.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

// ────────────────────────────────────────────────────────────────────────────
// Wire types
// ────────────────────────────────────────────────────────────────────────────

/// Message in a chat completions request/response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// Request body for `/chat/completions`.
#[derive(Debug, Serialize)]
pub struct OpenAiChatRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl From<super::ChatRequest> for OpenAiChatRequest {
    fn from(request: super::ChatRequest) -> Self {
        Self {
            model: request.model,
            messages: request
                .messages
                .into_iter()
                .map(|m| OpenAiMessage {
                    role: m.role.as_str().to_string(),
                    content: Some(m.content),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stop: request.stop,
        }
    }
}

/// One completion choice.
#[derive(Debug, Deserialize)]
pub struct OpenAiChoice {
    pub message: OpenAiMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Token accounting returned by the endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Response from `/chat/completions`.
#[derive(Debug, Deserialize)]
pub struct OpenAiChatResponse {
    pub choices: Vec<OpenAiChoice>,
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

impl TryFrom<OpenAiChatResponse> for super::ChatResponse {
    type Error = crate::Error;

    fn try_from(response: OpenAiChatResponse) -> crate::Result<Self> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| crate::Error::ProviderApi("response contained no choices".into()))?;

        let stop_reason = match choice.finish_reason.as_deref() {
            Some("length") => super::StopReason::MaxTokens,
            Some("content_filter") => super::StopReason::ContentFilter,
            Some("stop_sequence") => super::StopReason::StopSequence,
            _ => super::StopReason::EndTurn,
        };

        let usage = response.usage.unwrap_or_default();
        let mut total = super::Usage::new(usage.prompt_tokens, usage.completion_tokens);
        if usage.total_tokens > 0 {
            total.total_tokens = usage.total_tokens;
        }

        Ok(Self {
            text: choice.message.content.unwrap_or_default(),
            stop_reason,
            usage: total,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OpenAiProvider
// ────────────────────────────────────────────────────────────────────────────

/// OpenAI-compatible completion provider.
pub struct OpenAiProvider {
    base_url: String,
    api_key: ApiKey,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a provider against the public OpenAI API.
    pub fn new(api_key: impl Into<ApiKey>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the provider at a different OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Get the base URL for this provider.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform a chat completion request.
    pub async fn complete(&self, request: super::ChatRequest) -> crate::Result<super::ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %request.model, messages = request.messages.len(), "sending chat completion");

        let body = OpenAiChatRequest::from(request);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| crate::Error::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(crate::Error::ProviderApi(format!(
                "chat completions returned {}: {}",
                status, body
            )));
        }

        let parsed: OpenAiChatResponse = response
            .json()
            .await
            .map_err(|e| crate::Error::Request(e.to_string()))?;

        parsed.try_into()
    }
}

#[async_trait::async_trait]
impl super::CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: super::ChatRequest) -> crate::Result<super::ChatResponse> {
        self.complete(request).await
    }
}
