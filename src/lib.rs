pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod llm;
pub mod orchestrator;
pub mod responder;
pub mod retry;
pub mod schema;
pub mod state;
pub mod synthesizer;
pub mod validator;
pub mod widener;
