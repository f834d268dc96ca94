use async_trait::async_trait;
use tracing::warn;

use super::LanguageModel;
use crate::error::{AgentError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic messages API client.
pub struct AnthropicModel {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicModel {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 2048,
            "system": system,
            "messages": [
                {"role": "user", "content": user}
            ]
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("Anthropic API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Llm(format!(
                "Anthropic API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("Failed to parse Anthropic response: {}", e)))?;

        if let Some(stop_reason) = response_json.get("stop_reason").and_then(|r| r.as_str()) {
            if stop_reason == "max_tokens" {
                warn!(model = %self.model, "Anthropic response truncated by max_tokens");
            }
        }

        let content = response_json
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|blocks| blocks.first())
            .and_then(|block| block.get("text"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                AgentError::Llm(format!(
                    "No text content in Anthropic response: {}",
                    response_json
                ))
            })?;

        if content.trim().is_empty() {
            return Err(AgentError::Llm(
                "Empty content in Anthropic response".to_string(),
            ));
        }

        Ok(content.to_string())
    }

    fn name(&self) -> &str {
        &self.model
    }
}
