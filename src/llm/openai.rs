use async_trait::async_trait;
use tracing::warn;

use super::LanguageModel;
use crate::error::{AgentError, Result};

/// OpenAI-compatible chat completions client. Works against api.openai.com or
/// any gateway speaking the same protocol.
pub struct OpenAiChatModel {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiChatModel {
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
impl LanguageModel for OpenAiChatModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "temperature": 0.1,
        });

        // Reasoning models spend tokens before emitting content and reject the
        // legacy max_tokens field; older models only understand max_tokens.
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(2000);
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(1024);
        } else {
            body["max_tokens"] = serde_json::json!(1024);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("LLM API call failed: {}", e)))?;

        // Check HTTP status before trying to parse the body
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("Failed to parse LLM response body: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(AgentError::Llm(format!("LLM API error: {}", error)));
        }

        let choices = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                AgentError::Llm(format!("No choices in LLM response: {}", response_json))
            })?;

        // A truncated reply may still parse; a filtered one never will.
        if let Some(finish_reason) = choices[0].get("finish_reason").and_then(|r| r.as_str()) {
            if finish_reason == "length" {
                warn!(model = %self.model, "LLM response truncated by length limit");
            } else if finish_reason == "content_filter" {
                return Err(AgentError::Llm(
                    "LLM response was filtered by content policy".to_string(),
                ));
            }
        }

        let content = choices[0]["message"]["content"].as_str().ok_or_else(|| {
            AgentError::Llm(format!("No content in LLM response: {}", response_json))
        })?;

        if content.trim().is_empty() {
            return Err(AgentError::Llm("Empty content in LLM response".to_string()));
        }

        Ok(content.to_string())
    }

    fn name(&self) -> &str {
        &self.model
    }
}
