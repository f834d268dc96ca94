//! The orchestration loop.
//!
//! One request walks a small state machine: discover schema, synthesize SQL,
//! validate it, execute it, then either respond, refine with accumulated
//! error context, or widen the search after an empty result. All failure
//! kinds charge one shared retry counter that never resets, and both ceilings
//! are fixed constants, so the loop always terminates.
//!
//! Domain failures never surface as `Err`: a request that exhausts its budget
//! still produces an outcome with a graceful response and the raw errors in
//! the bundle. The only fatal condition is schema discovery failing for every
//! configured database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditStore, QueryAudit};
use crate::config::AgentConfig;
use crate::db::{DatabaseRegistry, SqlRow};
use crate::error::Result;
use crate::executor::QueryExecutor;
use crate::llm::LanguageModel;
use crate::responder::ResponseSynthesizer;
use crate::schema::provider::{SchemaCache, SchemaProvider};
use crate::state::{QueryPhase, RequestState};
use crate::synthesizer::SqlSynthesizer;
use crate::validator::SafetyValidator;
use crate::widener::{SearchWidener, Widening};

/// Refinement budget shared by generation, validation, and execution
/// failures. Fixed on purpose; a configurable ceiling invites unbounded
/// loops.
pub const MAX_RETRIES: u32 = 5;

/// Widening budget, charged against the same shared counter.
pub const MAX_WIDEN_ATTEMPTS: u32 = 5;

/// Everything a caller gets back: the answer plus the full diagnostic trail.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub query_id: String,
    pub generated_sql: String,
    /// Rows per connection alias from the last execution round.
    pub db_results: HashMap<String, Vec<SqlRow>>,
    pub final_response: String,
    pub sql_generation_error: Option<String>,
    pub validation_error: Option<String>,
    pub execution_error: Option<String>,
    pub retry_count: u32,
    pub query_type: QueryPhase,
    pub sql_history: Vec<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Synthesize,
    Validate,
    Execute,
    WidenGenerate,
}

/// Why the loop stopped. Decides which response path runs.
#[derive(Debug)]
enum RespondCause {
    HaveRows,
    EmptyRows,
    WideningExhausted(String),
    GenerationExhausted,
    ValidationExhausted,
    ExecutionExhausted,
}

/// Knobs the pipeline needs from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub disable_sql_blocking: bool,
    pub use_llm_validation: bool,
    pub schema_cache_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            disable_sql_blocking: false,
            use_llm_validation: true,
            schema_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&AgentConfig> for OrchestratorConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            disable_sql_blocking: config.disable_sql_blocking,
            use_llm_validation: config.use_llm_validation,
            schema_cache_ttl: config.schema_cache_ttl,
        }
    }
}

pub struct Orchestrator {
    provider: Arc<SchemaProvider>,
    synthesizer: Arc<SqlSynthesizer>,
    validator: SafetyValidator,
    executor: QueryExecutor,
    widener: SearchWidener,
    responder: ResponseSynthesizer,
    audit: Arc<AuditStore>,
    disable_sql_blocking: bool,
}

impl Orchestrator {
    /// Wires the pipeline around one model. Use `with_response_model` when a
    /// separate model should phrase the final answers.
    pub fn new(
        registry: Arc<DatabaseRegistry>,
        model: Arc<dyn LanguageModel>,
        config: OrchestratorConfig,
    ) -> Self {
        let answer_model = model.clone();
        Self::with_response_model(registry, model, answer_model, config)
    }

    pub fn with_response_model(
        registry: Arc<DatabaseRegistry>,
        model: Arc<dyn LanguageModel>,
        answer_model: Arc<dyn LanguageModel>,
        config: OrchestratorConfig,
    ) -> Self {
        let provider = Arc::new(SchemaProvider::new(
            registry.clone(),
            SchemaCache::new(config.schema_cache_ttl),
        ));
        let synthesizer = Arc::new(SqlSynthesizer::new(model.clone()));
        Self {
            executor: QueryExecutor::new(registry, provider.clone()),
            widener: SearchWidener::new(model.clone(), synthesizer.clone()),
            validator: SafetyValidator::new(model.clone(), config.use_llm_validation),
            responder: ResponseSynthesizer::new(model, answer_model),
            provider,
            synthesizer,
            audit: Arc::new(AuditStore::default()),
            disable_sql_blocking: config.disable_sql_blocking,
        }
    }

    /// Swaps in a caller-owned audit store, e.g. one shared with an admin
    /// surface. Without this the orchestrator keeps its own default store.
    pub fn with_audit_store(mut self, audit: Arc<AuditStore>) -> Self {
        self.audit = audit;
        self
    }

    pub fn audit_store(&self) -> Arc<AuditStore> {
        self.audit.clone()
    }

    /// Runs one request with the configured safety-gate setting.
    pub async fn run(&self, user_request: &str) -> Result<QueryOutcome> {
        self.run_with_options(user_request, self.disable_sql_blocking)
            .await
    }

    /// Runs one request. `disable_sql_blocking` skips the safety gate for
    /// this request only.
    pub async fn run_with_options(
        &self,
        user_request: &str,
        disable_sql_blocking: bool,
    ) -> Result<QueryOutcome> {
        let started = Instant::now();
        let query_id = Uuid::new_v4().to_string();
        info!(query_id = %query_id, request = %user_request, "request accepted");

        // The single fatal failure: nothing discoverable to query against.
        let discovery = self.provider.discover().await?;
        if discovery.is_empty() {
            warn!("schema discovery found no tables; generation will run without schema context");
        }

        let mut state = RequestState::new(user_request);
        let mut db_results: HashMap<String, Vec<SqlRow>> = HashMap::new();
        let mut stage = Stage::Synthesize;

        let cause = loop {
            stage = match stage {
                Stage::Synthesize => {
                    let result = self
                        .synthesizer
                        .synthesize(
                            &state.user_request,
                            &discovery,
                            state.error_context().as_deref(),
                            &state.sql_history,
                        )
                        .await;
                    match result {
                        Ok(sql) => {
                            state = state.with_candidate(sql, QueryPhase::Initial);
                            Stage::Validate
                        }
                        Err(e) => {
                            warn!(error = %e, "synthesis failed");
                            state = state.with_generation_failure(e.to_string());
                            if state.retry_count < MAX_RETRIES {
                                Stage::Synthesize
                            } else {
                                break RespondCause::GenerationExhausted;
                            }
                        }
                    }
                }

                Stage::Validate => {
                    if disable_sql_blocking {
                        info!("SQL safety gate disabled for this request");
                        state = state.with_validation_passed();
                        Stage::Execute
                    } else {
                        let verdict = self.validator.validate(&state.current_sql, &discovery).await;
                        if verdict.safe {
                            state = state.with_validation_passed();
                            Stage::Execute
                        } else {
                            let reason = verdict
                                .reason
                                .unwrap_or_else(|| "rejected by the safety gate".to_string());
                            warn!(reason = %reason, "candidate blocked by the safety gate");
                            state = state.with_validation_failure(reason);
                            if state.retry_count < MAX_RETRIES {
                                Stage::Synthesize
                            } else {
                                break RespondCause::ValidationExhausted;
                            }
                        }
                    }
                }

                Stage::Execute => {
                    let execution = self.executor.execute(&state.current_sql, &discovery).await;
                    db_results = execution.per_database;
                    match execution.error {
                        Some(error) => {
                            state = state.with_execution_failure(error, execution.rows);
                            if state.retry_count < MAX_RETRIES {
                                Stage::Synthesize
                            } else {
                                break RespondCause::ExecutionExhausted;
                            }
                        }
                        None => {
                            state = state.with_execution_success(execution.rows);
                            if !state.result_rows.is_empty() {
                                break RespondCause::HaveRows;
                            } else if state.retry_count < MAX_WIDEN_ATTEMPTS {
                                info!(
                                    attempt = state.retry_count + 1,
                                    "no rows; trying a wider search"
                                );
                                state = state.with_widening_charged();
                                Stage::WidenGenerate
                            } else {
                                break RespondCause::EmptyRows;
                            }
                        }
                    }
                }

                Stage::WidenGenerate => {
                    let widening = self
                        .widener
                        .widen(
                            &state.user_request,
                            &state.current_sql,
                            &discovery,
                            state.error_context().as_deref(),
                            &state.sql_history,
                        )
                        .await;
                    match widening {
                        Widening::Candidate(sql) => {
                            state = state.with_candidate(sql, QueryPhase::WiderSearch);
                            Stage::Validate
                        }
                        Widening::Exhausted { message } => {
                            break RespondCause::WideningExhausted(message)
                        }
                    }
                }
            };
        };

        let final_response = self.build_response(&state, &cause).await;
        state = state.with_final_response(final_response.clone());

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let success = matches!(cause, RespondCause::HaveRows);
        self.audit.record(
            QueryAudit::new(query_id.clone(), state.user_request.clone())
                .with_sql(state.current_sql.clone(), state.sql_history.clone())
                .with_retries(state.retry_count, state.query_phase)
                .with_errors(
                    state.generation_error.clone(),
                    state.validation_error.clone(),
                    state.execution_error.clone(),
                )
                .with_outcome(state.result_rows.len(), success, elapsed_ms),
        );
        info!(
            query_id = %query_id,
            retries = state.retry_count,
            rows = state.result_rows.len(),
            elapsed_ms,
            "request finished"
        );

        Ok(QueryOutcome {
            query_id,
            generated_sql: state.current_sql,
            db_results,
            final_response,
            sql_generation_error: state.generation_error,
            validation_error: state.validation_error,
            execution_error: state.execution_error,
            retry_count: state.retry_count,
            query_type: state.query_phase,
            sql_history: state.sql_history,
            elapsed_ms,
        })
    }

    async fn build_response(&self, state: &RequestState, cause: &RespondCause) -> String {
        match cause {
            RespondCause::HaveRows => {
                self.responder
                    .synthesize_response(&state.user_request, &state.result_rows)
                    .await
            }
            // partial fan-out rows are still worth an answer
            RespondCause::ExecutionExhausted if !state.result_rows.is_empty() => {
                self.responder
                    .synthesize_response(&state.user_request, &state.result_rows)
                    .await
            }
            RespondCause::ExecutionExhausted => {
                "The generated queries kept failing against the database, so I don't have \
                 an answer. Please try rephrasing the request."
                    .to_string()
            }
            RespondCause::GenerationExhausted => {
                "I wasn't able to generate a working SQL query for this request. Please \
                 try rephrasing it."
                    .to_string()
            }
            RespondCause::ValidationExhausted => {
                "I couldn't produce a query that passes the safety checks for this \
                 request, so nothing was executed."
                    .to_string()
            }
            // "even after widening" only when the last candidate actually
            // came from the widener; refinement alone can also drain the
            // budget before any widening round runs
            RespondCause::EmptyRows if state.query_phase == QueryPhase::WiderSearch => {
                "The query ran successfully but didn't return any results, even after \
                 widening the search. Try relaxing some of the criteria."
                    .to_string()
            }
            RespondCause::EmptyRows => {
                "The query ran successfully but didn't return any results. Try relaxing \
                 some of the criteria."
                    .to_string()
            }
            RespondCause::WideningExhausted(message) => format!(
                "The query ran successfully but didn't return any results. {}",
                message
            ),
        }
    }
}
