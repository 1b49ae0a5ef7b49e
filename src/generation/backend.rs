use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::errors::{AppError, GenerationError};

/// A single completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// The shared text-generation resource.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Backends that tolerate parallel calls bypass the request queue.
    fn supports_concurrent_calls(&self) -> bool {
        false
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, GenerationError>;
}

/// Client for any endpoint speaking the OpenAI chat-completions protocol,
/// hosted APIs and local inference servers alike.
#[derive(Clone)]
pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleBackend {
    pub fn new(config: &GenerationConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout + Duration::from_secs(5))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create generation client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!("Requesting completion from {} (model {})", url, self.model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": prompt.system },
                    { "role": "user", "content": prompt.user }
                ],
                "max_tokens": prompt.max_output_tokens,
                "temperature": prompt.temperature
            }))
            .send()
            .await
            .map_err(|e| GenerationError::Unavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = format!("endpoint returned {}: {}", status, error_text);
            return Err(
                if status.is_server_error() || status.as_u16() == 429 {
                    GenerationError::Unavailable(message)
                } else {
                    GenerationError::Rejected(message)
                },
            );
        }

        let result: serde_json::Value = response.json().await.map_err(|e| {
            GenerationError::Unavailable(format!("Failed to parse completion response: {}", e))
        })?;

        let content = result["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .unwrap_or_default();

        if content.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(content.to_string())
    }
}
