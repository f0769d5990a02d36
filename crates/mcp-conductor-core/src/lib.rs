//! Multi-source MCP orchestrator turning natural-language questions into
//! executed, read-only SQL.

pub mod cache;
pub mod catalog;
pub mod categorize;
pub mod client;
pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod parse;
pub mod prompt;
pub mod recovery;
pub mod registry;
pub mod resources;
pub mod sql;
pub mod types;

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use types::{QueryOptions, QueryResult};
