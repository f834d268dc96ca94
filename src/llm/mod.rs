//! LLM client layer.
//!
//! Everything that talks to a model goes through the `LanguageModel` trait so
//! the orchestration pipeline never branches on provider names. Concrete
//! clients live in the submodules; `build_model` picks one from configuration.

pub mod anthropic;
pub mod local;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{AgentError, Result};

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// One completion round: a system instruction plus a user message in, the
    /// raw text of the model's reply out.
    async fn complete(&self, system: &str, user: &str) -> Result<String>;

    /// Identifier for logs.
    fn name(&self) -> &str;
}

/// Builds the client for the configured provider.
pub fn build_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    let model: Arc<dyn LanguageModel> = match config.provider {
        LlmProvider::OpenAi => {
            if config.api_key.is_empty() {
                return Err(AgentError::Config(
                    "OPENAI_API_KEY must be set for the openai provider".to_string(),
                ));
            }
            Arc::new(openai::OpenAiChatModel::new(
                config.api_key.clone(),
                config.model.clone(),
                config.base_url.clone(),
            ))
        }
        LlmProvider::Local => Arc::new(local::LocalCompletionModel::new(
            config.base_url.clone(),
            config.model.clone(),
        )),
        LlmProvider::Anthropic => {
            if config.api_key.is_empty() {
                return Err(AgentError::Config(
                    "ANTHROPIC_API_KEY must be set for the anthropic provider".to_string(),
                ));
            }
            Arc::new(anthropic::AnthropicModel::new(
                config.api_key.clone(),
                config.model.clone(),
                config.base_url.clone(),
            ))
        }
    };
    Ok(model)
}

/// Strips markdown code fences and `<sql>` delimiter tags that models like to
/// wrap around their output.
pub fn clean_response(raw: &str) -> String {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```sql")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    cleaned
        .trim_start_matches("<sql>")
        .trim_end_matches("</sql>")
        .trim()
        .to_string()
}

/// Parses a structured JSON reply, tolerating fences and surrounding prose.
/// When the whole cleaned reply is not valid JSON, falls back to the first
/// balanced `{...}` block before giving up.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let cleaned = clean_response(raw);
    match serde_json::from_str(&cleaned) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            if let Some(block) = first_json_block(&cleaned) {
                if let Ok(value) = serde_json::from_str(block) {
                    return Ok(value);
                }
            }
            Err(AgentError::Llm(format!(
                "Failed to parse LLM response: {}. Response: {}",
                first_err, cleaned
            )))
        }
    }
}

fn first_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Payload {
        sql: String,
    }

    #[test]
    fn strips_json_fences() {
        let raw = "```json\n{\"sql\": \"SELECT 1\"}\n```";
        assert_eq!(clean_response(raw), "{\"sql\": \"SELECT 1\"}");
    }

    #[test]
    fn strips_sql_fences_and_tags() {
        assert_eq!(clean_response("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(clean_response("<sql>SELECT 1</sql>"), "SELECT 1");
        assert_eq!(clean_response("  SELECT 1  "), "SELECT 1");
    }

    #[test]
    fn parses_fenced_payload() {
        let parsed: Payload = parse_structured("```json\n{\"sql\": \"SELECT 1\"}\n```").unwrap();
        assert_eq!(parsed.sql, "SELECT 1");
    }

    #[test]
    fn parses_payload_with_leading_prose() {
        let parsed: Payload =
            parse_structured("Here is the query:\n{\"sql\": \"SELECT name FROM users\"}").unwrap();
        assert_eq!(parsed.sql, "SELECT name FROM users");
    }

    #[test]
    fn rejects_non_json_reply() {
        let result: Result<Payload> = parse_structured("I cannot answer that.");
        assert!(result.is_err());
    }

    #[test]
    fn json_block_ignores_braces_inside_strings() {
        let text = r#"note {"sql": "SELECT '}' AS brace"} trailing"#;
        assert_eq!(
            first_json_block(text).unwrap(),
            r#"{"sql": "SELECT '}' AS brace"}"#
        );
    }
}
