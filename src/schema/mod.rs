//! Schema catalog types shared by discovery, synthesis, and execution.

pub mod provider;

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Table name → schema, in discovery order. Insertion order is preserved so
/// prompts render the same way run to run.
pub type SchemaCatalog = IndexMap<String, TableSchema>;

/// Merged view of every reachable database, produced once per request.
///
/// Connection aliases only ever appear in `table_to_database`; everything
/// rendered into a prompt goes through `table_to_display_name`.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Merged catalog across databases. On a table-name collision the
    /// later-configured database wins.
    pub catalog: SchemaCatalog,
    /// Table name → connection alias, for routing.
    pub table_to_database: HashMap<String, String>,
    /// Table name → display database name, for anything the LLM sees.
    pub table_to_display_name: HashMap<String, String>,
}

impl Discovery {
    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    /// Canonical catalog key for `name`, matched case-insensitively.
    pub fn resolve_table(&self, name: &str) -> Option<&str> {
        if let Some((key, _)) = self.catalog.get_key_value(name) {
            return Some(key.as_str());
        }
        self.catalog
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .map(|k| k.as_str())
    }

    /// Closest known table name to `candidate`, for error annotation.
    pub fn closest_table(&self, candidate: &str) -> Option<&str> {
        let needle = candidate.to_lowercase();
        self.catalog
            .keys()
            .map(|t| (t, strsim::jaro_winkler(&t.to_lowercase(), &needle)))
            .filter(|(_, score)| *score > 0.84)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(t, _)| t.as_str())
    }

    /// Renders the catalog for LLM prompts, grouped by display database name.
    pub fn format_for_prompt(&self) -> String {
        let mut grouped: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for table in self.catalog.keys() {
            let display = self
                .table_to_display_name
                .get(table)
                .map(|s| s.as_str())
                .unwrap_or("unknown");
            grouped.entry(display).or_default().push(table.as_str());
        }

        let mut out = String::new();
        for (display, tables) in &grouped {
            out.push_str(&format!("Database: {}\n", display));
            for table in tables {
                let schema = &self.catalog[*table];
                match &schema.comment {
                    Some(c) => out.push_str(&format!("  Table: {} -- {}\n", table, c)),
                    None => out.push_str(&format!("  Table: {}\n", table)),
                }
                for col in &schema.columns {
                    let nullability = if col.nullable { "nullable" } else { "not null" };
                    match &col.comment {
                        Some(c) => out.push_str(&format!(
                            "    - {} ({}, {}) -- {}\n",
                            col.name, col.data_type, nullability, c
                        )),
                        None => out.push_str(&format!(
                            "    - {} ({}, {})\n",
                            col.name, col.data_type, nullability
                        )),
                    }
                }
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: false,
            comment: None,
        }
    }

    fn sample_discovery() -> Discovery {
        let mut catalog = SchemaCatalog::new();
        catalog.insert(
            "orders".to_string(),
            TableSchema {
                columns: vec![column("id", "integer"), column("total", "numeric")],
                comment: Some("one row per customer order".to_string()),
            },
        );
        catalog.insert(
            "products".to_string(),
            TableSchema {
                columns: vec![column("sku", "text")],
                comment: None,
            },
        );

        let mut table_to_database = HashMap::new();
        table_to_database.insert("orders".to_string(), "db1".to_string());
        table_to_database.insert("products".to_string(), "db2".to_string());

        let mut table_to_display_name = HashMap::new();
        table_to_display_name.insert("orders".to_string(), "production_sales".to_string());
        table_to_display_name.insert("products".to_string(), "inventory".to_string());

        Discovery {
            catalog,
            table_to_database,
            table_to_display_name,
        }
    }

    #[test]
    fn resolves_tables_case_insensitively() {
        let discovery = sample_discovery();
        assert_eq!(discovery.resolve_table("orders"), Some("orders"));
        assert_eq!(discovery.resolve_table("ORDERS"), Some("orders"));
        assert_eq!(discovery.resolve_table("missing"), None);
    }

    #[test]
    fn suggests_closest_table_for_typos() {
        let discovery = sample_discovery();
        assert_eq!(discovery.closest_table("order"), Some("orders"));
        assert_eq!(discovery.closest_table("prodcuts"), Some("products"));
        assert_eq!(discovery.closest_table("zzz_unrelated"), None);
    }

    #[test]
    fn prompt_rendering_groups_by_display_name() {
        let rendered = sample_discovery().format_for_prompt();
        assert!(rendered.contains("Database: production_sales"));
        assert!(rendered.contains("Database: inventory"));
        assert!(rendered.contains("Table: orders -- one row per customer order"));
        assert!(rendered.contains("- total (numeric, not null)"));
        // connection aliases must never be rendered
        assert!(!rendered.contains("db1"));
        assert!(!rendered.contains("db2"));
    }
}
