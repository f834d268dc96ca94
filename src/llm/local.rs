use async_trait::async_trait;

use super::LanguageModel;
use crate::error::{AgentError, Result};

/// Client for a local Ollama-style endpoint (`POST /api/generate`). Lets the
/// agent run against on-box models when queries must not leave the network.
pub struct LocalCompletionModel {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl LocalCompletionModel {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LanguageModel for LocalCompletionModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        // The generate endpoint takes a single prompt, so the system
        // instruction is folded in above the user message.
        let body = serde_json::json!({
            "model": self.model,
            "prompt": format!("{}\n\n{}", system, user),
            "stream": false,
            "options": {
                "temperature": 0.1,
                "num_predict": 2048,
            }
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("Local LLM call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Llm(format!(
                "Local LLM error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("Failed to parse local LLM response: {}", e)))?;

        let content = response_json
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| {
                AgentError::Llm(format!(
                    "No response field in local LLM reply: {}",
                    response_json
                ))
            })?;

        if content.trim().is_empty() {
            return Err(AgentError::Llm(
                "Empty response from local LLM".to_string(),
            ));
        }

        Ok(content.to_string())
    }

    fn name(&self) -> &str {
        &self.model
    }
}
