use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use querypilot::audit::AuditStore;
use querypilot::db::{Database, DatabaseRegistry, SqlRow};
use querypilot::error::{AgentError, Result};
use querypilot::llm::LanguageModel;
use querypilot::orchestrator::{Orchestrator, OrchestratorConfig, MAX_RETRIES};
use querypilot::schema::{ColumnInfo, SchemaCatalog, TableSchema};
use querypilot::state::QueryPhase;
use querypilot::validator::SafetyValidator;
use querypilot::widener::NO_WIDENING_MESSAGE;

/// Replays canned responses in order and records every (system, user) call.
/// Running out of responses fails the call, so each test scripts exactly the
/// calls it expects.
struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((system.to_string(), user.to_string()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Llm("scripted model ran out of responses".to_string()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Fails every call, counting them.
#[derive(Default)]
struct FailingModel {
    calls: AtomicUsize,
}

#[async_trait]
impl LanguageModel for FailingModel {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::Llm("connection refused".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// In-memory database handle with a scripted result queue and a log of every
/// executed statement.
struct MockDatabase {
    alias: String,
    catalog: SchemaCatalog,
    results: Mutex<VecDeque<Result<Vec<SqlRow>>>>,
    executed: Mutex<Vec<String>>,
}

impl MockDatabase {
    fn new(alias: &str, tables: &[(&str, &[&str])]) -> Arc<Self> {
        let mut catalog = SchemaCatalog::new();
        for (table, columns) in tables {
            catalog.insert(
                table.to_string(),
                TableSchema {
                    columns: columns
                        .iter()
                        .map(|c| ColumnInfo {
                            name: c.to_string(),
                            data_type: "text".to_string(),
                            nullable: true,
                            comment: None,
                        })
                        .collect(),
                    comment: None,
                },
            );
        }
        Arc::new(Self {
            alias: alias.to_string(),
            catalog,
            results: Mutex::new(VecDeque::new()),
            executed: Mutex::new(Vec::new()),
        })
    }

    fn push_rows(&self, rows: Vec<SqlRow>) {
        self.results.lock().unwrap().push_back(Ok(rows));
    }

    fn push_error(&self, message: &str) {
        self.results
            .lock()
            .unwrap()
            .push_back(Err(AgentError::Execution(message.to_string())));
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Database for MockDatabase {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn fetch_schema(&self) -> Result<SchemaCatalog> {
        Ok(self.catalog.clone())
    }

    async fn run_query(&self, sql: &str) -> Result<Vec<SqlRow>> {
        self.executed.lock().unwrap().push(sql.to_string());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Handle whose schema fetch always fails.
struct BrokenDatabase {
    alias: String,
}

#[async_trait]
impl Database for BrokenDatabase {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn fetch_schema(&self) -> Result<SchemaCatalog> {
        Err(AgentError::Database("connection reset by peer".to_string()))
    }

    async fn run_query(&self, _sql: &str) -> Result<Vec<SqlRow>> {
        Err(AgentError::Execution("unreachable".to_string()))
    }
}

fn row(pairs: &[(&str, serde_json::Value)]) -> SqlRow {
    let mut m = SqlRow::new();
    for (key, value) in pairs {
        m.insert(key.to_string(), value.clone());
    }
    m
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        use_llm_validation: false,
        ..OrchestratorConfig::default()
    }
}

#[tokio::test]
async fn test_total_generation_failure_still_answers() {
    let db = MockDatabase::new("salesdb", &[("orders", &["id", "status"])]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Sales Warehouse".to_string()));

    let model = Arc::new(FailingModel::default());
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let outcome = orchestrator.run("how many orders are there?").await.unwrap();

    assert_eq!(outcome.retry_count, MAX_RETRIES);
    assert!(outcome
        .final_response
        .contains("wasn't able to generate a working SQL query"));
    assert!(outcome.sql_generation_error.is_some());
    assert!(outcome.generated_sql.is_empty());
    assert!(outcome.sql_history.is_empty());
    assert_eq!(outcome.query_type, QueryPhase::Initial);
    assert!(db.executed().is_empty());
    // five synthesis rounds, four transport attempts each
    assert_eq!(model.calls.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn test_unsafe_candidate_blocked_then_refined() {
    let db = MockDatabase::new("salesdb", &[("orders", &["id", "status"])]);
    db.push_rows(vec![
        row(&[("id", json!(1)), ("status", json!("shipped"))]),
        row(&[("id", json!(2)), ("status", json!("shipped"))]),
    ]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Sales Warehouse".to_string()));

    let model = ScriptedModel::new(&[
        r#"{"sql": "DROP TABLE orders"}"#,
        r#"{"sql": "SELECT id, status FROM orders"}"#,
        "Answer in one short sentence.",
        "There are 2 shipped orders.",
    ]);
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let outcome = orchestrator.run("how many orders shipped?").await.unwrap();

    assert_eq!(outcome.retry_count, 1);
    assert_eq!(outcome.validation_error, None);
    assert_eq!(outcome.final_response, "There are 2 shipped orders.");
    assert_eq!(
        outcome.sql_history,
        vec![
            "DROP TABLE orders".to_string(),
            "SELECT id, status FROM orders".to_string(),
        ]
    );
    assert_eq!(outcome.generated_sql, "SELECT id, status FROM orders");
    assert_eq!(outcome.query_type, QueryPhase::Initial);
    // the blocked statement never reached the database
    assert_eq!(db.executed(), vec!["SELECT id, status FROM orders"]);
    assert_eq!(outcome.db_results.get("salesdb").map(Vec::len), Some(2));
    assert!(uuid::Uuid::parse_str(&outcome.query_id).is_ok());

    // the refinement prompt carries the block reason and the failed attempt
    let calls = model.calls();
    assert!(calls[1].1.contains("harmful keyword 'drop'"));
    assert!(calls[1].1.contains("PREVIOUSLY ATTEMPTED QUERIES"));
}

#[tokio::test]
async fn test_validation_exhaustion_yields_safety_message() {
    let db = MockDatabase::new("salesdb", &[("orders", &["id", "status"])]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Sales Warehouse".to_string()));

    let drop_sql = r#"{"sql": "DROP TABLE orders"}"#;
    let model = ScriptedModel::new(&[drop_sql, drop_sql, drop_sql, drop_sql, drop_sql]);
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let outcome = orchestrator.run("remove old orders").await.unwrap();

    assert_eq!(outcome.retry_count, MAX_RETRIES);
    assert!(outcome.final_response.contains("safety checks"));
    assert!(outcome
        .validation_error
        .as_deref()
        .unwrap()
        .contains("harmful keyword 'drop'"));
    assert_eq!(outcome.sql_history.len(), 5);
    assert!(db.executed().is_empty());
}

#[tokio::test]
async fn test_llm_audit_blocks_sql_the_patterns_allow() {
    let db = MockDatabase::new("hrdb", &[("employees", &["id", "name", "salary"])]);
    db.push_rows(vec![row(&[("name", json!("Ada"))])]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("HR Warehouse".to_string()));

    let first_sql = "SELECT name, salary FROM employees";
    // nothing in the deterministic pipeline objects to this query
    assert!(SafetyValidator::pattern_verdict(first_sql).safe);

    let model = ScriptedModel::new(&[
        r#"{"sql": "SELECT name, salary FROM employees"}"#,
        r#"{"is_safe": false, "security_issues": ["reads the restricted salary column"], "confidence_level": "high", "explanation": "compensation data is not queryable"}"#,
        r#"{"sql": "SELECT name FROM employees"}"#,
        r#"{"is_safe": true, "security_issues": [], "confidence_level": "high", "explanation": "single read-only statement"}"#,
        "Answer in one short sentence.",
        "Ada is the only employee listed.",
    ]);
    // shipped defaults keep the LLM audit on
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        model.clone(),
        OrchestratorConfig::default(),
    );

    let outcome = orchestrator.run("list employees").await.unwrap();

    assert_eq!(outcome.retry_count, 1);
    assert_eq!(outcome.validation_error, None);
    assert_eq!(outcome.final_response, "Ada is the only employee listed.");
    // the audited-out statement never reached the database
    assert_eq!(db.executed(), vec!["SELECT name FROM employees"]);

    let calls = model.calls();
    assert!(calls[1].0.contains("SQL security auditor"));
    assert!(calls[1].1.contains(first_sql));
    // the verdict reason, explanation and confidence feed the next attempt
    assert!(calls[2].1.contains("Previous errors encountered"));
    assert!(calls[2].1.contains("reads the restricted salary column"));
    assert!(calls[2].1.contains("compensation data is not queryable"));
    assert!(calls[2].1.contains("confidence: high"));
}

#[tokio::test]
async fn test_garbled_audit_reply_falls_back_to_patterns() {
    let db = MockDatabase::new("salesdb", &[("orders", &["id", "status"])]);
    db.push_rows(vec![row(&[("n", json!(2))])]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Sales Warehouse".to_string()));

    let model = ScriptedModel::new(&[
        r#"{"sql": "SELECT count(*) AS n FROM orders"}"#,
        "that looks fine to me",
        "Answer in one short sentence.",
        "There are 2 orders.",
    ]);
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        model.clone(),
        OrchestratorConfig::default(),
    );

    let outcome = orchestrator.run("how many orders?").await.unwrap();

    // the unusable audit reply falls through to the pattern pipeline,
    // which passes the clean query without charging the budget
    assert_eq!(outcome.retry_count, 0);
    assert_eq!(outcome.validation_error, None);
    assert_eq!(db.executed(), vec!["SELECT count(*) AS n FROM orders"]);
    assert_eq!(outcome.final_response, "There are 2 orders.");

    let calls = model.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[1].0.contains("SQL security auditor"));
}

#[tokio::test]
async fn test_garbled_audit_reply_still_blocks_harmful_sql() {
    let db = MockDatabase::new("salesdb", &[("orders", &["id", "status"])]);
    db.push_rows(vec![row(&[("id", json!(1))])]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Sales Warehouse".to_string()));

    let model = ScriptedModel::new(&[
        r#"{"sql": "DROP TABLE orders"}"#,
        "unable to audit this one",
        r#"{"sql": "SELECT id FROM orders"}"#,
        "still not a verdict",
        "Answer in one short sentence.",
        "One order remains.",
    ]);
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        model.clone(),
        OrchestratorConfig::default(),
    );

    let outcome = orchestrator.run("clear out old orders").await.unwrap();

    assert_eq!(outcome.retry_count, 1);
    assert_eq!(outcome.validation_error, None);
    assert_eq!(db.executed(), vec!["SELECT id FROM orders"]);
    assert_eq!(outcome.final_response, "One order remains.");

    // the pattern gate supplied the block reason for refinement
    let calls = model.calls();
    assert!(calls[2].1.contains("Previous errors encountered"));
    assert!(calls[2].1.contains("harmful keyword 'drop'"));
}

#[tokio::test]
async fn test_disable_sql_blocking_skips_the_gate() {
    let db = MockDatabase::new("salesdb", &[("orders", &["id", "status"])]);
    db.push_rows(vec![row(&[("deleted", json!(3))])]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Sales Warehouse".to_string()));

    let model = ScriptedModel::new(&[
        r#"{"sql": "DELETE FROM orders WHERE status = 'stale'"}"#,
        "Answer in one short sentence.",
        "Removed 3 stale orders.",
    ]);
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let outcome = orchestrator
        .run_with_options("remove stale orders", true)
        .await
        .unwrap();

    assert_eq!(outcome.retry_count, 0);
    assert_eq!(outcome.validation_error, None);
    assert_eq!(
        db.executed(),
        vec!["DELETE FROM orders WHERE status = 'stale'"]
    );
    assert_eq!(outcome.final_response, "Removed 3 stale orders.");
}

#[tokio::test]
async fn test_execution_error_feeds_the_next_attempt() {
    let db = MockDatabase::new("salesdb", &[("orders", &["id", "status"])]);
    db.push_error(r#"column "nonexistent" does not exist"#);
    db.push_rows(vec![row(&[("id", json!(1))])]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Sales Warehouse".to_string()));

    let model = ScriptedModel::new(&[
        r#"{"sql": "SELECT nonexistent FROM orders"}"#,
        r#"{"sql": "SELECT id FROM orders"}"#,
        "Answer in one short sentence.",
        "One order is open.",
    ]);
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let outcome = orchestrator.run("which orders are open?").await.unwrap();

    assert_eq!(outcome.retry_count, 1);
    // the execution channel clears once a later run succeeds
    assert_eq!(outcome.execution_error, None);
    assert_eq!(db.executed().len(), 2);
    assert_eq!(outcome.final_response, "One order is open.");

    let calls = model.calls();
    assert!(calls[1].1.contains("does not exist"));
    assert!(calls[1].1.contains("Previous errors encountered"));
}

#[tokio::test]
async fn test_empty_results_widen_then_succeed() {
    let db = MockDatabase::new("salesdb", &[("orders", &["id", "status"])]);
    db.push_rows(Vec::new());
    db.push_rows(vec![row(&[("id", json!(7))])]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Sales Warehouse".to_string()));

    let model = ScriptedModel::new(&[
        r#"{"sql": "SELECT id FROM orders WHERE status = 'Shipped'"}"#,
        "Try case-insensitive status matching and broader date ranges.",
        r#"{"sql": "SELECT id FROM orders WHERE lower(status) = 'shipped'"}"#,
        "Answer with the count.",
        "Found 1 shipped order.",
    ]);
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let outcome = orchestrator.run("find shipped orders").await.unwrap();

    assert_eq!(outcome.query_type, QueryPhase::WiderSearch);
    assert_eq!(outcome.retry_count, 1);
    assert_eq!(outcome.sql_history.len(), 2);
    assert_eq!(db.executed().len(), 2);
    assert_eq!(outcome.final_response, "Found 1 shipped order.");
    assert_eq!(outcome.execution_error, None);
}

#[tokio::test]
async fn test_widener_exhaustion_reports_gracefully() {
    let db = MockDatabase::new("salesdb", &[("orders", &["id", "status"])]);
    db.push_rows(Vec::new());
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Sales Warehouse".to_string()));

    let model = ScriptedModel::new(&[
        r#"{"sql": "SELECT id FROM orders WHERE status = 'Shipped'"}"#,
        // a blank strategy narrative means nothing is left to try
        "",
    ]);
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let outcome = orchestrator.run("find shipped orders").await.unwrap();

    assert!(outcome.final_response.contains(NO_WIDENING_MESSAGE));
    assert_eq!(outcome.retry_count, 1);
    assert_eq!(outcome.query_type, QueryPhase::Initial);
    assert_eq!(db.executed().len(), 1);
}

#[tokio::test]
async fn test_connection_aliases_never_reach_prompts() {
    let db = MockDatabase::new("salesdb_prod", &[("orders", &["id", "status"])]);
    db.push_rows(vec![row(&[("id", json!(1)), ("status", json!("open"))])]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Acme Sales Warehouse".to_string()));

    let model = ScriptedModel::new(&[
        r#"{"sql": "SELECT id, status FROM orders"}"#,
        "Answer in one short sentence.",
        "There is 1 open order.",
    ]);
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let outcome = orchestrator.run("list open orders").await.unwrap();
    assert_eq!(outcome.final_response, "There is 1 open order.");

    let calls = model.calls();
    assert!(!calls.is_empty());
    for (system, user) in &calls {
        assert!(!system.contains("salesdb_prod"), "alias leaked: {}", system);
        assert!(!user.contains("salesdb_prod"), "alias leaked: {}", user);
    }
    // prompts identify databases by display name only
    assert!(calls[0].1.contains("Acme Sales Warehouse"));
    assert!(calls[2].1.contains("Acme Sales Warehouse"));
}

#[tokio::test]
async fn test_cross_database_query_routes_through_router() {
    let orders_db = MockDatabase::new("ordersdb", &[("orders", &["id", "customer_id"])]);
    let customers_db = MockDatabase::new("customersdb", &[("customers", &["id", "name"])]);
    let router = MockDatabase::new("federation", &[]);
    router.push_rows(vec![row(&[("id", json!(1)), ("name", json!("Acme"))])]);

    let mut registry = DatabaseRegistry::new();
    registry.register(orders_db.clone(), Some("Orders DB".to_string()));
    registry.register(customers_db.clone(), Some("Customers DB".to_string()));
    registry.register_router(router.clone(), Some("Federation Layer".to_string()));

    let model = ScriptedModel::new(&[
        r#"{"sql": "SELECT o.id, c.name FROM orders o JOIN customers c ON o.customer_id = c.id"}"#,
        "Answer in one short sentence.",
        "Order 1 belongs to Acme.",
    ]);
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let outcome = orchestrator.run("who placed order 1?").await.unwrap();

    assert_eq!(outcome.final_response, "Order 1 belongs to Acme.");
    assert_eq!(router.executed().len(), 1);
    assert!(orders_db.executed().is_empty());
    assert!(customers_db.executed().is_empty());
}

#[tokio::test]
async fn test_cross_database_without_router_steers_refinement() {
    let orders_db = MockDatabase::new("ordersdb", &[("orders", &["id", "customer_id"])]);
    let customers_db = MockDatabase::new("customersdb", &[("customers", &["id", "name"])]);
    orders_db.push_rows(vec![row(&[("id", json!(1))])]);

    let mut registry = DatabaseRegistry::new();
    registry.register(orders_db.clone(), Some("Orders DB".to_string()));
    registry.register(customers_db.clone(), Some("Customers DB".to_string()));

    let model = ScriptedModel::new(&[
        r#"{"sql": "SELECT o.id, c.name FROM orders o JOIN customers c ON o.customer_id = c.id"}"#,
        r#"{"sql": "SELECT id FROM orders"}"#,
        "Answer in one short sentence.",
        "Order 1 is the only order.",
    ]);
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let outcome = orchestrator.run("who placed order 1?").await.unwrap();

    assert_eq!(outcome.retry_count, 1);
    assert_eq!(outcome.final_response, "Order 1 is the only order.");
    // the join was never executed anywhere
    assert_eq!(orders_db.executed(), vec!["SELECT id FROM orders"]);
    assert!(customers_db.executed().is_empty());

    let calls = model.calls();
    assert!(calls[1].1.contains("no cross-database router is configured"));
    assert!(calls[1].1.contains("Orders DB"));
    assert!(calls[1].1.contains("Customers DB"));
}

#[tokio::test]
async fn test_each_run_records_one_audit_entry() {
    let db = MockDatabase::new("salesdb", &[("orders", &["id", "status"])]);
    db.push_rows(vec![row(&[("n", json!(2))])]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Sales Warehouse".to_string()));

    let model = ScriptedModel::new(&[
        r#"{"sql": "SELECT count(*) AS n FROM orders"}"#,
        "Answer in one short sentence.",
        "There are 2 orders.",
    ]);
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let outcome = orchestrator.run("how many orders?").await.unwrap();

    let store = orchestrator.audit_store();
    assert_eq!(store.len(), 1);
    let entry = store.find(&outcome.query_id).unwrap();
    assert_eq!(entry.user_request, "how many orders?");
    assert_eq!(entry.generated_sql, outcome.generated_sql);
    assert_eq!(entry.sql_history, outcome.sql_history);
    assert_eq!(entry.query_type, outcome.query_type);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.row_count, 1);
    assert!(entry.success);
}

#[tokio::test]
async fn test_injected_audit_store_captures_failed_runs() {
    let db = MockDatabase::new("salesdb", &[("orders", &["id", "status"])]);
    let mut registry = DatabaseRegistry::new();
    registry.register(db.clone(), Some("Sales Warehouse".to_string()));

    let drop_sql = r#"{"sql": "DROP TABLE orders"}"#;
    let model = ScriptedModel::new(&[drop_sql, drop_sql, drop_sql, drop_sql, drop_sql]);
    let audit = Arc::new(AuditStore::new(16));
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config())
        .with_audit_store(audit.clone());

    let outcome = orchestrator.run("remove old orders").await.unwrap();

    // the caller-owned store received the entry, errors and all
    assert_eq!(audit.len(), 1);
    assert!(Arc::ptr_eq(&orchestrator.audit_store(), &audit));
    let entry = audit.find(&outcome.query_id).unwrap();
    assert!(!entry.success);
    assert_eq!(entry.retry_count, MAX_RETRIES);
    assert_eq!(entry.sql_history.len(), 5);
    assert!(entry
        .validation_error
        .as_deref()
        .unwrap()
        .contains("harmful keyword 'drop'"));
}

#[tokio::test]
async fn test_schema_discovery_failure_is_fatal() {
    let mut registry = DatabaseRegistry::new();
    registry.register(
        Arc::new(BrokenDatabase {
            alias: "salesdb".to_string(),
        }),
        Some("Sales Warehouse".to_string()),
    );

    let model = Arc::new(FailingModel::default());
    let orchestrator = Orchestrator::new(Arc::new(registry), model.clone(), test_config());

    let err = orchestrator.run("anything").await.unwrap_err();
    assert!(matches!(err, AgentError::Schema(_)));
    // no model call happens before discovery succeeds
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}
