//! Per-request pipeline state.
//!
//! `RequestState` moves through the orchestration loop by value: each step
//! consumes the old state and returns an updated copy via a `with_*` method,
//! so there is no shared mutable scratchpad and every transition is explicit.
//!
//! Invariants the transitions maintain:
//! - `sql_history` is append-only and `current_sql`, once set, is always a
//!   member of it.
//! - `retry_count` only grows. Generation, validation, and execution failures
//!   and widening rounds all charge the same counter.
//! - Each error channel is cleared by the success of its own step and is
//!   untouched by the other steps.

use serde::{Deserialize, Serialize};

use crate::db::SqlRow;

/// Where the current SQL candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPhase {
    /// Normal synthesis or refinement.
    Initial,
    /// Produced by the search widener after an empty result.
    WiderSearch,
}

/// One result row tagged with the display name of the database it came from.
#[derive(Debug, Clone, Serialize)]
pub struct TaggedRow {
    pub database: String,
    pub values: SqlRow,
}

#[derive(Debug, Clone)]
pub struct RequestState {
    pub user_request: String,
    pub current_sql: String,
    pub sql_history: Vec<String>,
    pub generation_error: Option<String>,
    pub validation_error: Option<String>,
    pub execution_error: Option<String>,
    pub retry_count: u32,
    pub query_phase: QueryPhase,
    pub result_rows: Vec<TaggedRow>,
    pub final_response: Option<String>,
}

impl RequestState {
    pub fn new(user_request: impl Into<String>) -> Self {
        Self {
            user_request: user_request.into(),
            current_sql: String::new(),
            sql_history: Vec::new(),
            generation_error: None,
            validation_error: None,
            execution_error: None,
            retry_count: 0,
            query_phase: QueryPhase::Initial,
            result_rows: Vec::new(),
            final_response: None,
        }
    }

    /// Accepts a freshly generated SQL candidate. Appends it to the history,
    /// marks its provenance, and clears the generation error channel.
    pub fn with_candidate(mut self, sql: String, phase: QueryPhase) -> Self {
        self.sql_history.push(sql.clone());
        self.current_sql = sql;
        self.query_phase = phase;
        self.generation_error = None;
        self
    }

    pub fn with_generation_failure(mut self, error: impl Into<String>) -> Self {
        self.generation_error = Some(error.into());
        self.retry_count += 1;
        self
    }

    pub fn with_validation_passed(mut self) -> Self {
        self.validation_error = None;
        self
    }

    pub fn with_validation_failure(mut self, reason: impl Into<String>) -> Self {
        self.validation_error = Some(reason.into());
        self.retry_count += 1;
        self
    }

    pub fn with_execution_success(mut self, rows: Vec<TaggedRow>) -> Self {
        self.result_rows = rows;
        self.execution_error = None;
        self
    }

    /// Execution failed. Partial rows from a fan-out are kept so the caller
    /// still sees what did come back.
    pub fn with_execution_failure(mut self, error: impl Into<String>, rows: Vec<TaggedRow>) -> Self {
        self.execution_error = Some(error.into());
        self.result_rows = rows;
        self.retry_count += 1;
        self
    }

    /// Charges one widening round against the shared retry budget.
    pub fn with_widening_charged(mut self) -> Self {
        self.retry_count += 1;
        self
    }

    pub fn with_final_response(mut self, response: impl Into<String>) -> Self {
        self.final_response = Some(response.into());
        self
    }

    /// Accumulated error context for refinement prompts, or None when every
    /// channel is clear.
    pub fn error_context(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(e) = &self.generation_error {
            parts.push(format!("generation: {}", e));
        }
        if let Some(e) = &self.validation_error {
            parts.push(format!("validation: {}", e));
        }
        if let Some(e) = &self.execution_error {
            parts.push(format!("execution: {}", e));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}
