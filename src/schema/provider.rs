//! Schema discovery across configured databases, with a TTL cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::db::DatabaseRegistry;
use crate::error::{AgentError, Result};
use crate::schema::{Discovery, SchemaCatalog};

struct CachedCatalog {
    fetched_at: Instant,
    catalog: SchemaCatalog,
}

/// TTL cache of per-database catalogs, keyed by connection alias. Shared by
/// discovery and execution-time probing so each backend is introspected at
/// most once per TTL window.
pub struct SchemaCache {
    entries: DashMap<String, CachedCatalog>,
    ttl: Duration,
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, alias: &str) -> Option<SchemaCatalog> {
        let fresh = {
            let entry = self.entries.get(alias)?;
            if entry.fetched_at.elapsed() <= self.ttl {
                Some(entry.catalog.clone())
            } else {
                None
            }
        };
        if fresh.is_none() {
            self.entries.remove(alias);
        }
        fresh
    }

    pub fn put(&self, alias: &str, catalog: SchemaCatalog) {
        self.entries.insert(
            alias.to_string(),
            CachedCatalog {
                fetched_at: Instant::now(),
                catalog,
            },
        );
    }

    pub fn invalidate(&self, alias: &str) {
        self.entries.remove(alias);
    }
}

/// Builds the merged schema view a request runs against.
pub struct SchemaProvider {
    registry: Arc<DatabaseRegistry>,
    cache: SchemaCache,
}

impl SchemaProvider {
    pub fn new(registry: Arc<DatabaseRegistry>, cache: SchemaCache) -> Self {
        Self { registry, cache }
    }

    /// Catalog for one database, served from cache when fresh.
    pub async fn catalog_for(&self, alias: &str) -> Result<SchemaCatalog> {
        if let Some(cached) = self.cache.get(alias) {
            return Ok(cached);
        }
        let handle = self
            .registry
            .get(alias)
            .ok_or_else(|| AgentError::Schema(format!("unknown database alias: {}", alias)))?;
        let catalog = handle.fetch_schema().await?;
        self.cache.put(alias, catalog.clone());
        Ok(catalog)
    }

    pub fn invalidate(&self, alias: &str) {
        self.cache.invalidate(alias);
    }

    /// Merged discovery across all configured databases.
    ///
    /// A database that fails introspection is logged and skipped; the request
    /// can still run against the rest. Only every database failing is fatal.
    pub async fn discover(&self) -> Result<Discovery> {
        let mut discovery = Discovery::default();
        let mut failures: Vec<String> = Vec::new();

        for handle in self.registry.handles() {
            let alias = handle.alias();
            let catalog = match self.catalog_for(alias).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(alias = %alias, error = %e, "schema discovery failed for database");
                    failures.push(format!("{}: {}", self.registry.display_name(alias), e));
                    continue;
                }
            };
            let display = self.registry.display_name(alias).to_string();
            for (table, schema) in catalog {
                if let Some(previous) = discovery.table_to_database.get(&table) {
                    if previous != alias {
                        warn!(
                            table = %table,
                            "table exposed by multiple databases; keeping the later-configured one"
                        );
                    }
                }
                discovery
                    .table_to_database
                    .insert(table.clone(), alias.to_string());
                discovery
                    .table_to_display_name
                    .insert(table.clone(), display.clone());
                discovery.catalog.insert(table, schema);
            }
        }

        if !self.registry.is_empty() && failures.len() == self.registry.len() {
            return Err(AgentError::Schema(format!(
                "schema discovery failed for every database: {}",
                failures.join("; ")
            )));
        }

        info!(
            tables = discovery.catalog.len(),
            databases = self.registry.len() - failures.len(),
            "schema discovery complete"
        );
        Ok(discovery)
    }
}
