//! The query pipeline: gather resources, generate SQL, execute, recover.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Deserialize;

use crate::cache::ResourceCache;
use crate::client::{ClientConnector, RmcpConnector};
use crate::config::Config;
use crate::error::{Error, Result, TransportError};
use crate::llm::LlmClient;
use crate::prompt::{PromptOptions, generation_prompt};
use crate::recovery::{RecoveryEngine, SqlExecutor, failure_outcome};
use crate::registry::{ServerRegistry, Session};
use crate::types::{
    ExecutionOutcome, QueryError, QueryMetadata, QueryOptions, QueryResult, QueryRows,
    RecoveryReport, ResolvedEntity, ServerStatusView,
};

/// Owns the component graph and exposes the single query entry point.
/// Construction wires registry, cache and recovery together; nothing here
/// is global.
pub struct Orchestrator {
    registry: Arc<ServerRegistry>,
    cache: Arc<ResourceCache>,
    llm: Arc<dyn LlmClient>,
    recovery: RecoveryEngine,
    prompt_opts: PromptOptions,
    fail_fast: bool,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        connector: Arc<dyn ClientConnector>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let registry = Arc::new(ServerRegistry::new(config.servers.clone(), connector));
        let cache = Arc::new(ResourceCache::new(
            registry.clone(),
            config.defaults.clone(),
            config.orchestration.cache_ttl(),
            config.orchestration.refresh_interval(),
        ));
        let prompt_opts = PromptOptions::default();
        let recovery = RecoveryEngine::new(
            llm.clone(),
            config.orchestration.max_retry_attempts,
            prompt_opts.clone(),
        );
        Self {
            registry,
            cache,
            llm,
            recovery,
            prompt_opts,
            fail_fast: config.orchestration.fail_fast,
            started: AtomicBool::new(false),
        }
    }

    /// Production wiring with the rmcp connector.
    pub fn with_defaults(config: &Config, llm: Arc<dyn LlmClient>) -> Self {
        Self::new(config, Arc::new(RmcpConnector), llm)
    }

    /// Connect all enabled servers and start the background refresher.
    /// Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.registry.start().await?;
        self.cache
            .spawn_refresher(self.registry.shutdown_token())
            .await;
        tracing::info!(target = "pipeline", "orchestrator started");
        Ok(())
    }

    /// Close every session and stop background work. Idempotent; queries
    /// submitted afterwards return the cancelled code.
    pub async fn shutdown(&self) {
        self.cache.stop().await;
        self.registry.shutdown().await;
    }

    pub async fn status(&self) -> Vec<ServerStatusView> {
        self.registry.status().await
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Process one natural-language query end to end. Every terminal state,
    /// error or success, comes back as a structured `QueryResult`.
    pub async fn process_query(&self, user_query: &str, options: QueryOptions) -> QueryResult {
        let started = std::time::Instant::now();
        let shutdown = self.registry.shutdown_token();
        let work = self.run_pipeline(user_query, &options);

        let output = tokio::select! {
            _ = shutdown.cancelled() => PipelineOutput::from_error(Error::Cancelled),
            output = async {
                match options.deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, work).await {
                        Ok(output) => output,
                        Err(_) => PipelineOutput::from_error(Error::Cancelled),
                    },
                    None => work.await,
                }
            } => output,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            target = "pipeline",
            success = output.error.is_none(),
            recovery_attempts = output.recovery.attempts,
            elapsed_ms,
            "query processed"
        );
        output.into_result(user_query, elapsed_ms)
    }

    async fn run_pipeline(&self, user_query: &str, options: &QueryOptions) -> PipelineOutput {
        if self.registry.is_shut_down() {
            return PipelineOutput::from_error(Error::Cancelled);
        }

        // 1. Gather the catalog.
        let catalog = self.cache.catalog().await;
        if catalog.is_empty() && self.fail_fast {
            return PipelineOutput::from_error(Error::NoResourcesAvailable);
        }
        let mut output =
            PipelineOutput { servers_used: catalog.server_ids(), ..Default::default() };

        // 2. Generate and parse the initial SQL.
        let prompt = generation_prompt(user_query, &catalog, &self.prompt_opts);
        let response = match self.llm.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => return output.fail(e),
        };
        let generated = match crate::parse::parse_llm_response(&response) {
            Ok(g) => g,
            Err(e) => return output.fail(e),
        };
        output.sql = Some(generated.sql.clone());
        output.resolved_entities = generated.resolved_entities.clone();
        output.explanation = generated.explanation.clone();

        // 3. Route to the executor.
        let Some(executor_session) = self.registry.executor().await else {
            return output.fail(Error::NoExecutorAvailable);
        };
        if !output.servers_used.iter().any(|id| id == executor_session.id()) {
            output.servers_used.push(executor_session.id().to_string());
        }
        let executor = SessionExecutor {
            registry: &self.registry,
            session: executor_session,
        };

        // 4. Execute.
        let failure = match executor.execute(&generated.sql).await {
            Ok(ExecutionOutcome::Completed(rows)) => {
                output.execution = Some(rows);
                return output;
            }
            Ok(ExecutionOutcome::Failed { engine_message, category, .. }) => {
                (engine_message, category)
            }
            Err(e) => return output.fail(e),
        };
        let (engine_message, category) = failure;
        tracing::warn!(target = "pipeline", category = %category, engine_message = %engine_message, "execution failed");

        // 5. Recover, unless told not to or the failure is terminal.
        if !category.is_recoverable() {
            return output.fail(Error::PermissionDenied(engine_message));
        }
        if !options.recovery_enabled() {
            return output.fail(Error::SqlExecution { category, message: engine_message });
        }

        let run = self
            .recovery
            .run(
                &executor,
                user_query,
                &catalog,
                &generated.sql,
                category,
                &engine_message,
            )
            .await;
        output.recovery = RecoveryReport {
            performed: !run.history.is_empty(),
            attempts: run.history.len() as u32,
            history: run.history,
        };
        match run.result {
            Ok((corrected, rows)) => {
                output.sql = Some(corrected.sql.clone());
                if !corrected.resolved_entities.is_empty() {
                    output.resolved_entities = corrected.resolved_entities;
                }
                if corrected.explanation.is_some() {
                    output.explanation = corrected.explanation;
                }
                output.execution = Some(rows);
                output
            }
            Err(e) => output.fail(e),
        }
    }
}

/// Executes SQL through the executor session's `execute_query` tool.
struct SessionExecutor<'a> {
    registry: &'a Arc<ServerRegistry>,
    session: Arc<Session>,
}

// Tolerant decode of the tool result payload.
#[derive(Debug, Deserialize)]
struct WireRows {
    columns: Vec<String>,
    rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    total_rows: Option<usize>,
    #[serde(default)]
    row_count: Option<usize>,
}

fn engine_message_from(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("error")
            .or_else(|| map.get("message"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}

#[async_trait]
impl SqlExecutor for SessionExecutor<'_> {
    async fn execute(&self, sql: &str) -> Result<ExecutionOutcome> {
        let client = self
            .session
            .client()
            .await
            .ok_or(Error::NoExecutorAvailable)?;
        let arguments = serde_json::json!({ "sql": sql });
        match client.call_tool("execute_query", arguments).await {
            Ok(out) if !out.is_error => {
                self.registry.mark_success(self.session.id()).await;
                let wire: WireRows = serde_json::from_value(out.payload).map_err(|e| {
                    Error::Transport(TransportError::protocol(format!(
                        "malformed executor payload: {e}"
                    )))
                })?;
                let row_count = wire.row_count.unwrap_or(wire.rows.len());
                Ok(ExecutionOutcome::Completed(QueryRows {
                    columns: wire.columns,
                    rows: wire.rows,
                    row_count,
                    truncated: wire.truncated,
                    total_rows: wire.total_rows,
                }))
            }
            Ok(out) => {
                // The engine rejected the SQL; the session itself is fine.
                self.registry.mark_success(self.session.id()).await;
                let message = engine_message_from(&out.payload);
                Ok(failure_outcome(message, Some(out.payload)))
            }
            Err(e) => {
                self.registry
                    .mark_failure(self.session.id(), &e.to_string())
                    .await;
                Err(Error::Transport(e))
            }
        }
    }
}

#[derive(Default)]
struct PipelineOutput {
    sql: Option<String>,
    execution: Option<QueryRows>,
    resolved_entities: Vec<ResolvedEntity>,
    explanation: Option<String>,
    recovery: RecoveryReport,
    servers_used: Vec<String>,
    error: Option<Error>,
}

impl PipelineOutput {
    fn from_error(error: Error) -> Self {
        Self { error: Some(error), ..Default::default() }
    }

    fn fail(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }

    fn into_result(self, user_query: &str, elapsed_ms: u64) -> QueryResult {
        let error = self.error.map(|e| QueryError {
            code: e.code().to_string(),
            message: e.to_string(),
            category: e.category(),
        });
        QueryResult {
            success: error.is_none(),
            user_query: user_query.to_string(),
            sql: self.sql,
            execution: self.execution,
            error,
            resolved_entities: self.resolved_entities,
            explanation: self.explanation,
            recovery: self.recovery,
            metadata: QueryMetadata { servers_used: self.servers_used, elapsed_ms },
        }
    }
}
