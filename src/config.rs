//! Environment-driven configuration.
//!
//! Everything is read once at startup by `AgentConfig::from_env`; nothing in
//! the pipeline touches the environment after that. Database connections are
//! declared as `alias=url` pairs so one agent can front several backends:
//!
//! ```text
//! QUERYPILOT_DATABASES=db1=postgres://...;db2=postgres://...
//! QUERYPILOT_DISPLAY_NAMES=db1=production_sales;db2=inventory  # LLM-facing names
//! QUERYPILOT_ROUTER=fed=postgres://...                          # optional federation endpoint
//! ```

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Which LLM backend to use. Parsed once at startup so the rest of the code
/// never matches on provider strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Local,
    Anthropic,
}

impl FromStr for LlmProvider {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "local" | "ollama" => Ok(LlmProvider::Local),
            "anthropic" => Ok(LlmProvider::Anthropic),
            other => Err(AgentError::Config(format!(
                "unknown LLM provider '{}' (expected openai, local, or anthropic)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Separate model for response phrasing; falls back to `model`.
    pub response_model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub alias: String,
    pub url: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub llm: LlmConfig,
    pub databases: Vec<DatabaseConfig>,
    /// Federation endpoint for queries spanning databases, as `alias=url`.
    pub router: Option<DatabaseConfig>,
    /// Skips the SQL safety gate entirely. Only for trusted deployments.
    pub disable_sql_blocking: bool,
    /// Uses the LLM safety judgment before the deterministic patterns.
    pub use_llm_validation: bool,
    pub schema_cache_ttl: Duration,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let provider: LlmProvider = env::var("QUERYPILOT_LLM_PROVIDER")
            .unwrap_or_else(|_| "openai".to_string())
            .parse()?;

        let llm = match provider {
            LlmProvider::OpenAi => LlmConfig {
                provider,
                api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                response_model: env::var("QUERYPILOT_RESPONSE_MODEL").ok(),
            },
            LlmProvider::Local => LlmConfig {
                provider,
                api_key: String::new(),
                base_url: env::var("LOCAL_LLM_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:11434".to_string()),
                model: env::var("LOCAL_LLM_MODEL").unwrap_or_else(|_| "llama3.2".to_string()),
                response_model: env::var("QUERYPILOT_RESPONSE_MODEL").ok(),
            },
            LlmProvider::Anthropic => LlmConfig {
                provider,
                api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
                base_url: env::var("ANTHROPIC_BASE_URL")
                    .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
                model: env::var("ANTHROPIC_MODEL")
                    .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
                response_model: env::var("QUERYPILOT_RESPONSE_MODEL").ok(),
            },
        };

        let databases_raw = env::var("QUERYPILOT_DATABASES").map_err(|_| {
            AgentError::Config(
                "QUERYPILOT_DATABASES must list at least one alias=url pair".to_string(),
            )
        })?;
        let display_names = env::var("QUERYPILOT_DISPLAY_NAMES").unwrap_or_default();
        let display_pairs = parse_pairs(&display_names, "QUERYPILOT_DISPLAY_NAMES")?;

        let mut databases = Vec::new();
        for (alias, url) in parse_pairs(&databases_raw, "QUERYPILOT_DATABASES")? {
            let display_name = display_pairs
                .iter()
                .find(|(a, _)| *a == alias)
                .map(|(_, name)| name.clone());
            databases.push(DatabaseConfig {
                alias,
                url,
                display_name,
            });
        }
        if databases.is_empty() {
            return Err(AgentError::Config(
                "QUERYPILOT_DATABASES must list at least one alias=url pair".to_string(),
            ));
        }

        let router = match env::var("QUERYPILOT_ROUTER") {
            Ok(raw) if !raw.trim().is_empty() => {
                let mut pairs = parse_pairs(&raw, "QUERYPILOT_ROUTER")?;
                if pairs.len() != 1 {
                    return Err(AgentError::Config(
                        "QUERYPILOT_ROUTER must be a single alias=url pair".to_string(),
                    ));
                }
                let (alias, url) = pairs.remove(0);
                let display_name = display_pairs
                    .iter()
                    .find(|(a, _)| *a == alias)
                    .map(|(_, name)| name.clone());
                Some(DatabaseConfig {
                    alias,
                    url,
                    display_name,
                })
            }
            _ => None,
        };

        Ok(Self {
            llm,
            databases,
            router,
            disable_sql_blocking: env_flag("QUERYPILOT_DISABLE_SQL_BLOCKING", false),
            use_llm_validation: env_flag("QUERYPILOT_LLM_VALIDATION", true),
            schema_cache_ttl: Duration::from_secs(
                env::var("QUERYPILOT_SCHEMA_CACHE_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
        })
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Parses `alias=value;alias=value` lists. Values may contain `=` (database
/// URLs with query strings do), so only the first `=` splits.
fn parse_pairs(raw: &str, var_name: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (alias, value) = entry.split_once('=').ok_or_else(|| {
            AgentError::Config(format!(
                "{}: expected alias=value, got '{}'",
                var_name, entry
            ))
        })?;
        let alias = alias.trim();
        if alias.is_empty() || value.is_empty() {
            return Err(AgentError::Config(format!(
                "{}: empty alias or value in '{}'",
                var_name, entry
            )));
        }
        pairs.push((alias.to_string(), value.to_string()));
    }
    Ok(pairs)
}
