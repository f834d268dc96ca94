//! Request audit trail.
//!
//! One entry per completed request, kept in memory with a bounded capacity.
//! Entries capture the whole arc of a request (every SQL attempted, the error
//! channels, the retry spend) so misbehaving requests can be reconstructed
//! after the fact.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::QueryPhase;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAudit {
    pub query_id: String,
    pub user_request: String,
    pub generated_sql: String,
    pub sql_history: Vec<String>,
    pub retry_count: u32,
    pub query_type: QueryPhase,
    pub generation_error: Option<String>,
    pub validation_error: Option<String>,
    pub execution_error: Option<String>,
    pub row_count: usize,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl QueryAudit {
    pub fn new(query_id: String, user_request: String) -> Self {
        Self {
            query_id,
            user_request,
            generated_sql: String::new(),
            sql_history: Vec::new(),
            retry_count: 0,
            query_type: QueryPhase::Initial,
            generation_error: None,
            validation_error: None,
            execution_error: None,
            row_count: 0,
            success: false,
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }

    pub fn with_sql(mut self, generated_sql: String, sql_history: Vec<String>) -> Self {
        self.generated_sql = generated_sql;
        self.sql_history = sql_history;
        self
    }

    pub fn with_retries(mut self, retry_count: u32, query_type: QueryPhase) -> Self {
        self.retry_count = retry_count;
        self.query_type = query_type;
        self
    }

    pub fn with_errors(
        mut self,
        generation: Option<String>,
        validation: Option<String>,
        execution: Option<String>,
    ) -> Self {
        self.generation_error = generation;
        self.validation_error = validation;
        self.execution_error = execution;
        self
    }

    pub fn with_outcome(mut self, row_count: usize, success: bool, elapsed_ms: u64) -> Self {
        self.row_count = row_count;
        self.success = success;
        self.elapsed_ms = elapsed_ms;
        self
    }
}

/// Bounded in-memory audit store. At capacity the oldest entry is evicted.
pub struct AuditStore {
    entries: Mutex<VecDeque<QueryAudit>>,
    capacity: usize,
}

impl AuditStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn record(&self, audit: QueryAudit) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= self.capacity && !entries.is_empty() {
                entries.pop_front();
            }
            entries.push_back(audit);
        }
    }

    pub fn recent(&self, n: usize) -> Vec<QueryAudit> {
        match self.entries.lock() {
            Ok(entries) => {
                let start = entries.len().saturating_sub(n);
                entries.iter().skip(start).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn find(&self, query_id: &str) -> Option<QueryAudit> {
        self.entries
            .lock()
            .ok()?
            .iter()
            .find(|a| a.query_id == query_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditStore {
    fn default() -> Self {
        Self::new(1000)
    }
}
