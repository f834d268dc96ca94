//! Database access layer.
//!
//! Concrete backends implement the `Database` trait; the registry owns the
//! configured handles plus the alias → display-name mapping and the optional
//! cross-database router endpoint.

pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::schema::SchemaCatalog;

/// One result row as a column → JSON value map.
pub type SqlRow = serde_json::Map<String, serde_json::Value>;

#[async_trait]
pub trait Database: Send + Sync {
    /// Connection alias this handle was registered under.
    fn alias(&self) -> &str;

    /// Introspects the backend and returns its table catalog.
    async fn fetch_schema(&self) -> Result<SchemaCatalog>;

    /// Runs one read query and returns its rows. Error messages must not
    /// contain the connection alias; they can end up in LLM prompts.
    async fn run_query(&self, sql: &str) -> Result<Vec<SqlRow>>;
}

/// Configured database handles for one agent instance.
#[derive(Default)]
pub struct DatabaseRegistry {
    handles: Vec<Arc<dyn Database>>,
    display_names: HashMap<String, String>,
    router: Option<Arc<dyn Database>>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle. `display_name` is the name the LLM sees; when it
    /// is None the alias doubles as the display name.
    pub fn register(&mut self, handle: Arc<dyn Database>, display_name: Option<String>) {
        if let Some(name) = display_name {
            self.display_names.insert(handle.alias().to_string(), name);
        }
        self.handles.push(handle);
    }

    /// Registers the federation endpoint used for queries that span
    /// databases. The router is not part of schema discovery.
    pub fn register_router(&mut self, handle: Arc<dyn Database>, display_name: Option<String>) {
        if let Some(name) = display_name {
            self.display_names.insert(handle.alias().to_string(), name);
        }
        self.router = Some(handle);
    }

    pub fn handles(&self) -> &[Arc<dyn Database>] {
        &self.handles
    }

    pub fn get(&self, alias: &str) -> Option<&Arc<dyn Database>> {
        self.handles.iter().find(|h| h.alias() == alias)
    }

    pub fn router(&self) -> Option<&Arc<dyn Database>> {
        self.router.as_ref()
    }

    /// Display name for an alias, falling back to the alias itself when the
    /// operator configured no separate name.
    pub fn display_name<'a>(&'a self, alias: &'a str) -> &'a str {
        self.display_names
            .get(alias)
            .map(|s| s.as_str())
            .unwrap_or(alias)
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}
