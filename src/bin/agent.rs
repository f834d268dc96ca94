//! Command-line entry point.
//!
//! Reads connection and model settings from the environment, wires the
//! pipeline, runs one request, and prints the answer (or the full outcome
//! bundle as JSON).

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use querypilot::config::{AgentConfig, LlmConfig};
use querypilot::db::DatabaseRegistry;
use querypilot::db::postgres::PostgresDatabase;
use querypilot::llm::build_model;
use querypilot::orchestrator::{Orchestrator, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "agent")]
#[command(about = "Ask configured databases a question in plain language")]
#[command(version)]
struct Args {
    /// The question to answer, e.g. "how many orders shipped last week?"
    request: String,

    /// Print the full outcome bundle as JSON instead of just the answer
    #[arg(long)]
    json: bool,

    /// Skip the SQL safety gate for this request
    #[arg(long)]
    disable_sql_blocking: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = AgentConfig::from_env().context("failed to load configuration")?;

    let model = build_model(&config.llm).context("failed to build the language model")?;
    let answer_model = match &config.llm.response_model {
        Some(name) => {
            let response_config = LlmConfig {
                model: name.clone(),
                ..config.llm.clone()
            };
            build_model(&response_config).context("failed to build the response model")?
        }
        None => model.clone(),
    };

    let mut registry = DatabaseRegistry::new();
    for db in &config.databases {
        let handle = PostgresDatabase::connect(&db.alias, &db.url)
            .await
            .with_context(|| format!("failed to connect database '{}'", db.alias))?;
        info!(alias = %db.alias, "database connected");
        registry.register(Arc::new(handle), db.display_name.clone());
    }
    if let Some(router) = &config.router {
        let handle = PostgresDatabase::connect(&router.alias, &router.url)
            .await
            .with_context(|| format!("failed to connect router '{}'", router.alias))?;
        info!(alias = %router.alias, "cross-database router connected");
        registry.register_router(Arc::new(handle), router.display_name.clone());
    }

    let orchestrator = Orchestrator::with_response_model(
        Arc::new(registry),
        model,
        answer_model,
        OrchestratorConfig::from(&config),
    );

    let outcome = orchestrator
        .run_with_options(&args.request, args.disable_sql_blocking || config.disable_sql_blocking)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.final_response);
    }

    Ok(())
}
