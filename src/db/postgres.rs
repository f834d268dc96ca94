//! PostgreSQL backend.
//!
//! Schema introspection reads `information_schema.columns` joined against the
//! catalog tables so table and column comments ride along; they feed straight
//! into generation prompts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tracing::{info, warn};

use super::{Database, SqlRow};
use crate::error::{AgentError, Result};
use crate::schema::{ColumnInfo, SchemaCatalog, TableSchema};

const SCHEMA_QUERY: &str = r#"
SELECT c.table_name,
       c.column_name,
       c.data_type,
       c.is_nullable,
       col_description(pc.oid, c.ordinal_position::int) AS column_comment,
       obj_description(pc.oid, 'pg_class') AS table_comment
FROM information_schema.columns c
JOIN pg_catalog.pg_class pc
  ON pc.relname = c.table_name
JOIN pg_catalog.pg_namespace pn
  ON pn.oid = pc.relnamespace AND pn.nspname = c.table_schema
WHERE c.table_schema = 'public'
ORDER BY c.table_name, c.ordinal_position
"#;

pub struct PostgresDatabase {
    alias: String,
    pool: PgPool,
}

impl PostgresDatabase {
    /// Connects and verifies the pool with a probe query.
    pub async fn connect(alias: &str, database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| AgentError::Database(format!("Failed to connect: {}", e)))?;

        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| AgentError::Database(format!("Connection probe failed: {}", e)))?;

        info!(alias = %alias, "connected to PostgreSQL");
        Ok(Self {
            alias: alias.to_string(),
            pool,
        })
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn fetch_schema(&self) -> Result<SchemaCatalog> {
        let rows = sqlx::query(SCHEMA_QUERY)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AgentError::Schema(format!("Schema introspection failed: {}", e)))?;

        let mut catalog = SchemaCatalog::new();
        for row in rows {
            let table: String = row.try_get("table_name").unwrap_or_default();
            if table.is_empty() {
                continue;
            }
            let column = ColumnInfo {
                name: row.try_get("column_name").unwrap_or_default(),
                data_type: row.try_get("data_type").unwrap_or_default(),
                nullable: row
                    .try_get::<String, _>("is_nullable")
                    .map(|v| v == "YES")
                    .unwrap_or(true),
                comment: row
                    .try_get::<Option<String>, _>("column_comment")
                    .ok()
                    .flatten(),
            };
            let table_comment = row
                .try_get::<Option<String>, _>("table_comment")
                .ok()
                .flatten();

            let entry = catalog.entry(table).or_insert_with(TableSchema::default);
            if entry.comment.is_none() {
                entry.comment = table_comment;
            }
            entry.columns.push(column);
        }

        info!(alias = %self.alias, tables = catalog.len(), "schema discovered");
        Ok(catalog)
    }

    async fn run_query(&self, sql: &str) -> Result<Vec<SqlRow>> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            // The engine message (missing relation, syntax position, ...) is
            // what refinement needs; the alias stays out of it.
            .map_err(|e| AgentError::Execution(e.to_string()))?;

        Ok(rows.iter().map(row_to_json).collect())
    }
}

/// Converts one row to JSON by column type name, falling back through
/// progressively looser decodes. Columns no rung can decode come back as
/// null rather than failing the whole result set.
fn row_to_json(row: &PgRow) -> SqlRow {
    let mut out = SqlRow::new();
    for (i, col) in row.columns().iter().enumerate() {
        let value = decode_column(row, i, col.type_info().name());
        out.insert(col.name().to_string(), value);
    }
    out
}

fn decode_column(row: &PgRow, i: usize, type_name: &str) -> Value {
    match type_name {
        "INT2" => row
            .try_get::<Option<i16>, _>(i)
            .map(|v| v.map_or(Value::Null, Value::from))
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(i)
            .map(|v| v.map_or(Value::Null, Value::from))
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(i)
            .map(|v| v.map_or(Value::Null, Value::from))
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(i)
            .map(|v| v.map_or(Value::Null, |n| Value::from(n as f64)))
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(i)
            .map(|v| v.map_or(Value::Null, Value::from))
            .unwrap_or(Value::Null),
        // NUMERIC has no direct f64 decode; go through BigDecimal. Aggregates
        // (SUM, AVG, COUNT(*)::numeric) land here constantly.
        "NUMERIC" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(i)
            .map(|v| {
                v.and_then(|d| d.to_string().parse::<f64>().ok())
                    .map_or(Value::Null, Value::from)
            })
            .unwrap_or(Value::Null),
        "BOOL" => row
            .try_get::<Option<bool>, _>(i)
            .map(|v| v.map_or(Value::Null, Value::from))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(i)
            .map(|v| v.unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(i)
            .map(|v| v.map_or(Value::Null, |u| Value::String(u.to_string())))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(i)
            .map(|v| v.map_or(Value::Null, |d| Value::String(d.to_string())))
            .unwrap_or(Value::Null),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(i)
            .map(|v| v.map_or(Value::Null, |t| Value::String(t.to_string())))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(i)
            .map(|v| v.map_or(Value::Null, |t| Value::String(t.to_string())))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(i)
            .map(|v| v.map_or(Value::Null, |t| Value::String(t.to_rfc3339())))
            .unwrap_or(Value::Null),
        _ => decode_fallback(row, i, type_name),
    }
}

fn decode_fallback(row: &PgRow, i: usize, type_name: &str) -> Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(i) {
        return v.map_or(Value::Null, Value::String);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
        return v.map_or(Value::Null, Value::from);
    }
    warn!(column_type = type_name, "undecodable column type, returning null");
    Value::Null
}
