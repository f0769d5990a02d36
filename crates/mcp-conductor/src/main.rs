//! Service shell: wire the orchestrator from a configuration file, answer
//! queries from stdin as JSON lines, shut down cleanly on ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use mcp_conductor_core::config::{self, Config};
use mcp_conductor_core::llm::HttpLlmClient;
use mcp_conductor_core::{Orchestrator, QueryOptions};

fn config_path() -> Result<String> {
    if let Some(path) = std::env::args().nth(1) {
        return Ok(path);
    }
    std::env::var("MCP_CONDUCTOR_CONFIG")
        .context("pass a config path as the first argument or set MCP_CONDUCTOR_CONFIG")
}

fn load(path: &str) -> Result<Config> {
    config::load_config(path).with_context(|| format!("loading configuration from {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Structured logging via tracing with env filter.
    // Configure via RUST_LOG, e.g. RUST_LOG=info,mcp_conductor=debug
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,mcp_conductor=debug"))
        .unwrap();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();

    let path = config_path()?;
    let cfg = load(&path)?;

    let llm_cfg = cfg
        .llm
        .clone()
        .context("configuration has no llm section")?;
    let llm = Arc::new(HttpLlmClient::new(&llm_cfg)?);

    let orchestrator = Arc::new(Orchestrator::with_defaults(&cfg, llm));
    orchestrator.start().await?;
    for server in orchestrator.status().await {
        tracing::info!(
            target = "conductor",
            id = %server.id,
            state = %server.state,
            priority = server.priority,
            tools = server.tools,
            "server"
        );
    }

    // Read one query per line until EOF or ctrl-c; print each result as a
    // JSON line on stdout.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target = "conductor", "interrupt received");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(query) if !query.trim().is_empty() => {
                        let result = orchestrator
                            .process_query(query.trim(), QueryOptions::default())
                            .await;
                        println!("{}", serde_json::to_string(&result)?);
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
