//! Query execution and database routing.
//!
//! The executor decides where a SQL candidate runs: the single database that
//! owns its tables, the federation router when tables span databases, or a
//! fan-out across every backend when a table cannot be located at all. It
//! never returns `Err`: rows and an error message can coexist (a fan-out may
//! partially succeed), so the caller always gets both.

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use regex::Regex;
use sqlparser::ast::{Query, SetExpr, Statement, TableFactor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::{debug, info, warn};

use crate::db::{Database, DatabaseRegistry, SqlRow};
use crate::error::AgentError;
use crate::schema::provider::SchemaProvider;
use crate::schema::Discovery;
use crate::state::TaggedRow;

/// Result of one execution round. `rows` are tagged with display database
/// names; `per_database` is keyed by connection alias and never reaches
/// a prompt.
#[derive(Debug, Default)]
pub struct Execution {
    pub rows: Vec<TaggedRow>,
    pub per_database: HashMap<String, Vec<SqlRow>>,
    pub error: Option<String>,
}

pub struct QueryExecutor {
    registry: Arc<DatabaseRegistry>,
    provider: Arc<SchemaProvider>,
}

impl QueryExecutor {
    pub fn new(registry: Arc<DatabaseRegistry>, provider: Arc<SchemaProvider>) -> Self {
        Self { registry, provider }
    }

    pub async fn execute(&self, sql: &str, discovery: &Discovery) -> Execution {
        let tables = extract_table_names(sql);
        debug!(tables = ?tables, "extracted table references");

        let mut target_aliases: Vec<String> = Vec::new();
        let mut unknown: Vec<String> = Vec::new();
        for table in &tables {
            let alias = discovery
                .resolve_table(table)
                .and_then(|canonical| discovery.table_to_database.get(canonical));
            match alias {
                Some(alias) => {
                    if !target_aliases.contains(alias) {
                        target_aliases.push(alias.clone());
                    }
                }
                None => unknown.push(table.clone()),
            }
        }

        // A table missing from the merged catalog may still exist in a
        // backend whose discovery failed or whose schema changed since the
        // cache was filled; probe each database before giving up on it.
        let mut fan_out = false;
        for table in &unknown {
            match self.probe_for_table(table).await {
                Some(alias) => {
                    if !target_aliases.contains(&alias) {
                        target_aliases.push(alias);
                    }
                }
                None => {
                    warn!(table = %table, "table not found in any schema; querying every database");
                    fan_out = true;
                }
            }
        }

        if fan_out {
            return self.execute_fanout(sql, discovery).await;
        }
        match target_aliases.as_slice() {
            [] => {
                // No table references at all (SELECT 1 and friends): any
                // backend can answer, so the first configured one does.
                match self.registry.handles().first() {
                    Some(handle) => {
                        let handle = handle.clone();
                        self.execute_single(&handle, sql, discovery).await
                    }
                    None => Execution {
                        error: Some("no databases are configured".to_string()),
                        ..Execution::default()
                    },
                }
            }
            [alias] => match self.registry.get(alias) {
                Some(handle) => {
                    let handle = handle.clone();
                    self.execute_single(&handle, sql, discovery).await
                }
                None => Execution {
                    error: Some(format!(
                        "database for table routing is not registered: {}",
                        self.registry.display_name(alias)
                    )),
                    ..Execution::default()
                },
            },
            _ => self.execute_routed(sql, discovery, &target_aliases).await,
        }
    }

    async fn execute_single(
        &self,
        handle: &Arc<dyn Database>,
        sql: &str,
        discovery: &Discovery,
    ) -> Execution {
        let alias = handle.alias().to_string();
        let display_name = self.registry.display_name(&alias).to_string();
        match handle.run_query(sql).await {
            Ok(rows) => {
                info!(database = %display_name, rows = rows.len(), "query executed");
                let tagged = rows
                    .iter()
                    .cloned()
                    .map(|values| TaggedRow {
                        database: display_name.clone(),
                        values,
                    })
                    .collect();
                Execution {
                    rows: tagged,
                    per_database: HashMap::from([(alias, rows)]),
                    error: None,
                }
            }
            Err(e) => {
                warn!(database = %display_name, error = %e, "query failed");
                Execution {
                    rows: Vec::new(),
                    per_database: HashMap::from([(alias, Vec::new())]),
                    error: Some(format!(
                        "query failed on {}: {}",
                        display_name,
                        annotate_error(&error_text(&e), discovery)
                    )),
                }
            }
        }
    }

    /// Tables span more than one database. With a router configured the query
    /// goes there; without one this is an execution error that steers the
    /// next refinement round toward a single database.
    async fn execute_routed(
        &self,
        sql: &str,
        discovery: &Discovery,
        aliases: &[String],
    ) -> Execution {
        let display_list = aliases
            .iter()
            .map(|a| self.registry.display_name(a))
            .join(", ");
        match self.registry.router() {
            Some(router) => {
                info!(databases = %display_list, "routing cross-database query through the federation endpoint");
                let router = router.clone();
                self.execute_single(&router, sql, discovery).await
            }
            None => {
                warn!(databases = %display_list, "cross-database query without a configured router");
                Execution {
                    rows: Vec::new(),
                    per_database: HashMap::new(),
                    error: Some(format!(
                        "the query references tables from multiple databases ({}) but no \
                         cross-database router is configured; rewrite it to use tables \
                         from a single database",
                        display_list
                    )),
                }
            }
        }
    }

    /// Last resort: run everywhere and keep whatever comes back. Failures
    /// accumulate into one combined error while successful rows are kept.
    async fn execute_fanout(&self, sql: &str, discovery: &Discovery) -> Execution {
        let mut rows = Vec::new();
        let mut per_database = HashMap::new();
        let mut errors = Vec::new();

        for handle in self.registry.handles() {
            let alias = handle.alias().to_string();
            let display_name = self.registry.display_name(&alias).to_string();
            match handle.run_query(sql).await {
                Ok(db_rows) => {
                    rows.extend(db_rows.iter().cloned().map(|values| TaggedRow {
                        database: display_name.clone(),
                        values,
                    }));
                    per_database.insert(alias, db_rows);
                }
                Err(e) => {
                    errors.push(format!(
                        "{}: {}",
                        display_name,
                        annotate_error(&error_text(&e), discovery)
                    ));
                    per_database.insert(alias, Vec::new());
                }
            }
        }

        let error = if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        };
        info!(
            rows = rows.len(),
            failures = errors.len(),
            "fan-out execution finished"
        );
        Execution {
            rows,
            per_database,
            error,
        }
    }

    async fn probe_for_table(&self, table: &str) -> Option<String> {
        for handle in self.registry.handles() {
            if let Ok(catalog) = self.provider.catalog_for(handle.alias()).await {
                if catalog.keys().any(|k| k.eq_ignore_ascii_case(table)) {
                    info!(table = %table, alias = handle.alias(), "resolved unmapped table by probing");
                    return Some(handle.alias().to_string());
                }
            }
        }
        None
    }
}

fn error_text(e: &AgentError) -> String {
    match e {
        AgentError::Execution(msg) | AgentError::Database(msg) => msg.clone(),
        other => other.to_string(),
    }
}

lazy_static::lazy_static! {
    static ref MISSING_RELATION: Regex =
        Regex::new(r#"(?i)relation "([^"]+)" does not exist"#).unwrap();
    static ref MISSING_COLUMN: Regex =
        Regex::new(r#"(?i)column "?([A-Za-z_][A-Za-z0-9_.]*)"? does not exist"#).unwrap();
    static ref FROM_JOIN: Regex =
        Regex::new(r"(?i)\b(?:from|join)\s+([A-Za-z_][A-Za-z0-9_.]*)").unwrap();
    static ref CTE_NAME: Regex =
        Regex::new(r"(?i)\b([A-Za-z_][A-Za-z0-9_]*)\s+as\s*\(").unwrap();
}

/// Points refinement at the schema when the engine reports a missing table or
/// column, with a did-you-mean for near-miss table names.
fn annotate_error(message: &str, discovery: &Discovery) -> String {
    let mut annotated = message.to_string();
    if let Some(caps) = MISSING_RELATION.captures(message) {
        annotated.push_str(
            ". The referenced table does not exist; use only tables from the provided schema",
        );
        if let Some(suggestion) = discovery.closest_table(&caps[1]) {
            annotated.push_str(&format!(" (closest match: {})", suggestion));
        }
        annotated.push('.');
    } else if MISSING_COLUMN.is_match(message) {
        annotated.push_str(
            ". The referenced column does not exist; re-check the schema for correct column names.",
        );
    }
    annotated
}

/// Best-effort table extraction. The AST walk covers FROM, JOIN, CTE bodies,
/// derived tables, and set operations; a lexical pass catches what the walk
/// does not descend into (correlated subqueries in WHERE, unparseable SQL).
/// CTE names are excluded since they are not schema tables.
pub fn extract_table_names(sql: &str) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    let mut cte_names: Vec<String> = Vec::new();

    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => {
            for statement in &statements {
                if let Statement::Query(query) = statement {
                    collect_from_query(query, &mut tables, &mut cte_names);
                }
            }
        }
        Err(e) => {
            debug!(error = %e, "SQL parse failed, relying on lexical scan");
        }
    }

    lexical_scan(sql, &mut tables, &mut cte_names);
    tables.retain(|t| !cte_names.iter().any(|c| c.eq_ignore_ascii_case(t)));
    tables
}

fn push_unique(out: &mut Vec<String>, name: String) {
    if !name.is_empty() && !out.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
        out.push(name);
    }
}

fn collect_from_query(query: &Query, tables: &mut Vec<String>, ctes: &mut Vec<String>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            push_unique(ctes, cte.alias.name.value.clone());
            collect_from_query(&cte.query, tables, ctes);
        }
    }
    collect_from_set_expr(&query.body, tables, ctes);
}

fn collect_from_set_expr(expr: &SetExpr, tables: &mut Vec<String>, ctes: &mut Vec<String>) {
    match expr {
        SetExpr::Select(select) => {
            for twj in &select.from {
                collect_from_table_factor(&twj.relation, tables, ctes);
                for join in &twj.joins {
                    collect_from_table_factor(&join.relation, tables, ctes);
                }
            }
        }
        SetExpr::Query(query) => collect_from_query(query, tables, ctes),
        SetExpr::SetOperation { left, right, .. } => {
            collect_from_set_expr(left, tables, ctes);
            collect_from_set_expr(right, tables, ctes);
        }
        _ => {}
    }
}

fn collect_from_table_factor(factor: &TableFactor, tables: &mut Vec<String>, ctes: &mut Vec<String>) {
    match factor {
        // args Some(..) means a table-valued function, not a schema table
        TableFactor::Table { name, args: None, .. } => {
            if let Some(ident) = name.0.last() {
                push_unique(tables, ident.value.clone());
            }
        }
        TableFactor::Derived { subquery, .. } => collect_from_query(subquery, tables, ctes),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            collect_from_table_factor(&table_with_joins.relation, tables, ctes);
            for join in &table_with_joins.joins {
                collect_from_table_factor(&join.relation, tables, ctes);
            }
        }
        _ => {}
    }
}

fn lexical_scan(sql: &str, tables: &mut Vec<String>, ctes: &mut Vec<String>) {
    for caps in CTE_NAME.captures_iter(sql) {
        push_unique(ctes, caps[1].to_string());
    }
    for caps in FROM_JOIN.captures_iter(sql) {
        if let Some(m) = caps.get(1) {
            // an identifier directly followed by '(' is a function call, not a table
            if sql[m.end()..].trim_start().starts_with('(') {
                continue;
            }
            let name = m.as_str();
            let bare = name.rsplit('.').next().unwrap_or(name);
            push_unique(tables, bare.to_string());
        }
    }
}
