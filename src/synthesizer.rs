//! SQL synthesis and refinement.
//!
//! One component serves both jobs: a fresh generation is just a refinement
//! with no accumulated errors. Error context from failed attempts is appended
//! to the prompt as plain text, and every previously attempted query rides
//! along so the model does not repeat itself.

use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::llm::{self, LanguageModel};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::schema::Discovery;

const SYNTH_SYSTEM: &str = "You are a SQL generation engine for PostgreSQL. \
Given a user request and the available schema, produce exactly one read-only SQL query. \
Use only tables and columns that appear in the schema. \
Respond with a JSON object of the form {\"sql\": \"...\"} and nothing else.";

#[derive(Debug, Deserialize)]
struct SqlPayload {
    sql: String,
}

pub struct SqlSynthesizer {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
}

impl SqlSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        // Transport and parse failures get three retries with short
        // exponential backoff, visible here rather than buried in the client.
        Self {
            model,
            retry: RetryPolicy::new(3, Duration::from_millis(200), Duration::from_secs(5), 2.0),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Generates one SQL candidate. With `error_context` set this is a
    /// refinement round; without it, a fresh generation.
    pub async fn synthesize(
        &self,
        request: &str,
        discovery: &Discovery,
        error_context: Option<&str>,
        history: &[String],
    ) -> Result<String> {
        self.generate(request, discovery, None, error_context, history)
            .await
    }

    /// Like `synthesize`, but steers generation with an alternative-strategy
    /// narrative produced by the search widener.
    pub async fn synthesize_with_strategy(
        &self,
        request: &str,
        discovery: &Discovery,
        strategy: &str,
        error_context: Option<&str>,
        history: &[String],
    ) -> Result<String> {
        self.generate(request, discovery, Some(strategy), error_context, history)
            .await
    }

    async fn generate(
        &self,
        request: &str,
        discovery: &Discovery,
        strategy: Option<&str>,
        error_context: Option<&str>,
        history: &[String],
    ) -> Result<String> {
        let prompt = build_prompt(request, discovery, strategy, error_context, history);
        debug!(prompt_len = prompt.len(), "requesting SQL candidate");

        let sql = retry_with_backoff(
            &self.retry,
            "sql-synthesis",
            || {
                let prompt = prompt.clone();
                async move {
                    let raw = self.model.complete(SYNTH_SYSTEM, &prompt).await?;
                    recover_sql(&raw)
                }
            },
            |e| matches!(e, AgentError::Llm(_)),
        )
        .await
        .map_err(|e| {
            AgentError::Generation(format!(
                "SQL generation failed after {} attempts: {}",
                self.retry.max_retries + 1,
                e
            ))
        })?;

        info!(model = self.model.name(), sql = %sql, "SQL candidate generated");
        Ok(sql)
    }
}

fn build_prompt(
    request: &str,
    discovery: &Discovery,
    strategy: Option<&str>,
    error_context: Option<&str>,
    history: &[String],
) -> String {
    let mut sections = Vec::new();
    sections.push(format!("USER REQUEST:\n{}", request));
    if let Some(errors) = error_context {
        sections.push(format!(
            "Previous errors encountered: {}; please generate a corrected query.",
            errors
        ));
    }
    if let Some(strategy) = strategy {
        sections.push(format!(
            "ALTERNATIVE SEARCH STRATEGIES TO APPLY:\n{}",
            strategy
        ));
    }
    sections.push(format!(
        "AVAILABLE SCHEMA:\n{}",
        discovery.format_for_prompt()
    ));
    if !history.is_empty() {
        let attempts = history
            .iter()
            .enumerate()
            .map(|(i, sql)| format!("{}. {}", i + 1, sql))
            .join("\n");
        sections.push(format!(
            "PREVIOUSLY ATTEMPTED QUERIES (do not repeat these):\n{}",
            attempts
        ));
    }
    sections.push("Respond with {\"sql\": \"...\"} only.".to_string());
    sections.join("\n\n")
}

/// Extracts SQL from a model reply. The structured `{"sql": ...}` form is the
/// happy path; plain text with fences or delimiter tags is the fallback. A
/// reply with no SQL in it, structured or not, is a parse failure so the
/// retry wrapper can have another go.
fn recover_sql(raw: &str) -> Result<String> {
    if let Ok(payload) = llm::parse_structured::<SqlPayload>(raw) {
        let sql = payload.sql.trim().to_string();
        if sql.is_empty() {
            // structured but blank; cleaning the envelope would only recover
            // the envelope text itself
            return Err(AgentError::Llm(format!(
                "model reply contained no usable SQL: {:?}",
                raw
            )));
        }
        return Ok(sql);
    }
    let cleaned = llm::clean_response(raw);
    if cleaned.is_empty() {
        return Err(AgentError::Llm(format!(
            "model reply contained no usable SQL: {:?}",
            raw
        )));
    }
    Ok(cleaned)
}
