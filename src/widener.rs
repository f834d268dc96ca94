//! Search widening after empty results.
//!
//! When a valid query runs cleanly but finds nothing, the model first
//! narrates alternative search strategies (relaxed filters, substring or
//! case-insensitive matching, broader ranges, related tables), and that
//! narrative then steers a fresh synthesis round. Widening shares the retry
//! budget with refinement, so a request that keeps coming back empty still
//! terminates.

use std::sync::Arc;

use itertools::Itertools;
use tracing::{info, warn};

use crate::error::Result;
use crate::llm::LanguageModel;
use crate::schema::Discovery;
use crate::synthesizer::SqlSynthesizer;

const WIDEN_SYSTEM: &str = "You help broaden database searches that returned no rows. \
Given the user's request, the SQL that found nothing, the schema, any errors from earlier \
attempts, and the queries already tried, suggest concrete alternative strategies: relax or \
remove filters, match case-insensitively or by substring, widen date ranges, or try related \
tables. Do not suggest repeating a query that was already tried. Reply with a short numbered \
list in plain text.";

pub const NO_WIDENING_MESSAGE: &str =
    "No alternative search strategies are available for this request.";

/// One widening round: either a new candidate to validate, or the admission
/// that there is nothing left to try.
#[derive(Debug)]
pub enum Widening {
    Candidate(String),
    Exhausted { message: String },
}

pub struct SearchWidener {
    model: Arc<dyn LanguageModel>,
    synthesizer: Arc<SqlSynthesizer>,
}

impl SearchWidener {
    pub fn new(model: Arc<dyn LanguageModel>, synthesizer: Arc<SqlSynthesizer>) -> Self {
        Self { model, synthesizer }
    }

    pub async fn widen(
        &self,
        request: &str,
        failed_sql: &str,
        discovery: &Discovery,
        error_context: Option<&str>,
        history: &[String],
    ) -> Widening {
        let narrative = match self
            .strategy_narrative(request, failed_sql, discovery, error_context, history)
            .await
        {
            Ok(n) if !n.trim().is_empty() => n,
            Ok(_) => {
                info!("widener produced no strategies");
                return Widening::Exhausted {
                    message: NO_WIDENING_MESSAGE.to_string(),
                };
            }
            Err(e) => {
                warn!(error = %e, "strategy narration failed");
                return Widening::Exhausted {
                    message: NO_WIDENING_MESSAGE.to_string(),
                };
            }
        };
        info!(strategies = %narrative, "widening the search");

        match self
            .synthesizer
            .synthesize_with_strategy(request, discovery, &narrative, error_context, history)
            .await
        {
            Ok(sql) => Widening::Candidate(sql),
            Err(e) => {
                warn!(error = %e, "widened synthesis failed");
                Widening::Exhausted {
                    message: NO_WIDENING_MESSAGE.to_string(),
                }
            }
        }
    }

    /// Stage (a): asks for the alternative-strategies narrative. The model
    /// sees everything the synthesizer would, so its suggestions account for
    /// what already failed.
    async fn strategy_narrative(
        &self,
        request: &str,
        failed_sql: &str,
        discovery: &Discovery,
        error_context: Option<&str>,
        history: &[String],
    ) -> Result<String> {
        let mut sections = vec![
            format!("USER REQUEST:\n{}", request),
            format!("QUERY THAT RETURNED NO ROWS:\n{}", failed_sql),
            format!("AVAILABLE SCHEMA:\n{}", discovery.format_for_prompt()),
        ];
        if let Some(errors) = error_context {
            sections.push(format!("ERRORS FROM EARLIER ATTEMPTS:\n{}", errors));
        }
        if !history.is_empty() {
            let attempts = history
                .iter()
                .enumerate()
                .map(|(i, sql)| format!("{}. {}", i + 1, sql))
                .join("\n");
            sections.push(format!("QUERIES ALREADY TRIED:\n{}", attempts));
        }
        self.model.complete(WIDEN_SYSTEM, &sections.join("\n\n")).await
    }
}
