//! Natural-language response synthesis.
//!
//! Two stages: the first model call designs a phrasing prompt tailored to
//! this request and result shape; the second call runs that prompt against
//! the data to produce the answer the user reads. Either call failing
//! degrades to a fixed apology, so the pipeline always ends with something
//! presentable.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use crate::llm::LanguageModel;
use crate::state::TaggedRow;

const MAX_ROWS_PER_DATABASE: usize = 50;

const STAGE_ONE_SYSTEM: &str = "You design prompts for a data assistant. Given a user's \
question and the rows that came back, write the system prompt a second model should follow \
to phrase the final answer: tone, which figures to highlight, how much detail to include. \
Reply with the prompt text only.";

pub const FALLBACK_RESPONSE: &str = "I'm sorry, but I wasn't able to put together an answer \
for this request. Please try rephrasing it.";

pub struct ResponseSynthesizer {
    prompt_model: Arc<dyn LanguageModel>,
    answer_model: Arc<dyn LanguageModel>,
}

impl ResponseSynthesizer {
    pub fn new(prompt_model: Arc<dyn LanguageModel>, answer_model: Arc<dyn LanguageModel>) -> Self {
        Self {
            prompt_model,
            answer_model,
        }
    }

    /// Produces the user-facing answer for a request and its result rows.
    pub async fn synthesize_response(&self, request: &str, rows: &[TaggedRow]) -> String {
        let formatted = format_rows(rows);

        let stage_one_user = format!(
            "USER QUESTION:\n{}\n\nRESULT DATA:\n{}\n\nWrite the phrasing prompt now.",
            request, formatted
        );
        let phrasing_prompt = match self
            .prompt_model
            .complete(STAGE_ONE_SYSTEM, &stage_one_user)
            .await
        {
            Ok(p) if !p.trim().is_empty() => p,
            Ok(_) => {
                warn!("empty phrasing prompt from model");
                return FALLBACK_RESPONSE.to_string();
            }
            Err(e) => {
                warn!(error = %e, "response prompt design failed");
                return FALLBACK_RESPONSE.to_string();
            }
        };

        let stage_two_user = format!("USER QUESTION:\n{}\n\nRESULT DATA:\n{}", request, formatted);
        match self
            .answer_model
            .complete(&phrasing_prompt, &stage_two_user)
            .await
        {
            Ok(answer) if !answer.trim().is_empty() => answer.trim().to_string(),
            Ok(_) => {
                warn!("empty final response from model");
                FALLBACK_RESPONSE.to_string()
            }
            Err(e) => {
                warn!(error = %e, "final response synthesis failed");
                FALLBACK_RESPONSE.to_string()
            }
        }
    }
}

/// Renders rows grouped and labeled by source database, capped per group so
/// a huge result set does not blow up the prompt.
fn format_rows(rows: &[TaggedRow]) -> String {
    if rows.is_empty() {
        return "(no rows)".to_string();
    }
    let mut grouped: IndexMap<&str, Vec<&TaggedRow>> = IndexMap::new();
    for row in rows {
        grouped.entry(row.database.as_str()).or_default().push(row);
    }

    let mut out = String::new();
    for (database, rows) in &grouped {
        out.push_str(&format!(
            "Database results ({}), {} row(s):\n",
            database,
            rows.len()
        ));
        for row in rows.iter().take(MAX_ROWS_PER_DATABASE) {
            out.push_str(&serde_json::to_string(&row.values).unwrap_or_else(|_| "{}".to_string()));
            out.push('\n');
        }
        if rows.len() > MAX_ROWS_PER_DATABASE {
            out.push_str(&format!(
                "... and {} more rows\n",
                rows.len() - MAX_ROWS_PER_DATABASE
            ));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::db::SqlRow;
    use crate::error::{AgentError, Result};

    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::Llm("script exhausted".to_string())))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn tagged(database: &str, key: &str, value: i64) -> TaggedRow {
        let mut values = SqlRow::new();
        values.insert(key.to_string(), serde_json::json!(value));
        TaggedRow {
            database: database.to_string(),
            values,
        }
    }

    #[test]
    fn rows_are_grouped_and_labeled_by_database() {
        let rows = vec![
            tagged("production_sales", "n", 1),
            tagged("inventory", "n", 2),
            tagged("production_sales", "n", 3),
        ];
        let formatted = format_rows(&rows);
        assert!(formatted.contains("Database results (production_sales), 2 row(s):"));
        assert!(formatted.contains("Database results (inventory), 1 row(s):"));
    }

    #[test]
    fn oversized_groups_are_capped() {
        let rows: Vec<TaggedRow> = (0..60).map(|i| tagged("sales", "n", i)).collect();
        let formatted = format_rows(&rows);
        assert!(formatted.contains("... and 10 more rows"));
    }

    #[test]
    fn empty_rows_render_a_placeholder() {
        assert_eq!(format_rows(&[]), "(no rows)");
    }

    #[tokio::test]
    async fn two_stage_synthesis_produces_the_answer() {
        let prompt_model = ScriptedModel::new(vec![Ok(
            "Answer concisely, lead with the total.".to_string()
        )]);
        let answer_model =
            ScriptedModel::new(vec![Ok("There were 42 signups last week.".to_string())]);
        let responder = ResponseSynthesizer::new(prompt_model, answer_model);

        let answer = responder
            .synthesize_response("how many signups last week", &[tagged("sales", "n", 42)])
            .await;
        assert_eq!(answer, "There were 42 signups last week.");
    }

    #[tokio::test]
    async fn prompt_design_failure_falls_back() {
        let prompt_model = ScriptedModel::new(vec![Err(AgentError::Llm("down".to_string()))]);
        let answer_model = ScriptedModel::new(vec![]);
        let responder = ResponseSynthesizer::new(prompt_model, answer_model);

        let answer = responder.synthesize_response("q", &[]).await;
        assert_eq!(answer, FALLBACK_RESPONSE);
    }

    #[tokio::test]
    async fn answer_failure_falls_back() {
        let prompt_model = ScriptedModel::new(vec![Ok("Be brief.".to_string())]);
        let answer_model = ScriptedModel::new(vec![Err(AgentError::Llm("down".to_string()))]);
        let responder = ResponseSynthesizer::new(prompt_model, answer_model);

        let answer = responder.synthesize_response("q", &[]).await;
        assert_eq!(answer, FALLBACK_RESPONSE);
    }

    #[tokio::test]
    async fn blank_answer_falls_back() {
        let prompt_model = ScriptedModel::new(vec![Ok("Be brief.".to_string())]);
        let answer_model = ScriptedModel::new(vec![Ok("   ".to_string())]);
        let responder = ResponseSynthesizer::new(prompt_model, answer_model);

        let answer = responder.synthesize_response("q", &[]).await;
        assert_eq!(answer, FALLBACK_RESPONSE);
    }
}
