//! Bounded, category-guided retry loop over failed SQL executions.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::catalog::AggregatedCatalog;
use crate::categorize::{ErrorCategory, categorize};
use crate::error::Error;
use crate::llm::LlmClient;
use crate::parse::parse_llm_response;
use crate::prompt::{PromptOptions, RecoveryPromptRequest, recovery_prompt};
use crate::sql::{qualified_columns, referenced_tables};
use crate::types::{ExecutionOutcome, GeneratedSql, QueryRows, RecoveryAttempt};

/// Execution seam. The orchestrator backs this with the executor session;
/// tests script outcomes directly.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<ExecutionOutcome, Error>;
}

/// Result of a full recovery run, with the per-attempt history in
/// attempt_no order.
pub struct RecoveryRun {
    pub result: Result<(GeneratedSql, QueryRows), Error>,
    pub history: Vec<RecoveryAttempt>,
}

pub struct RecoveryEngine {
    llm: Arc<dyn LlmClient>,
    max_attempts: u32,
    prompt_opts: PromptOptions,
}

impl RecoveryEngine {
    pub fn new(llm: Arc<dyn LlmClient>, max_attempts: u32, prompt_opts: PromptOptions) -> Self {
        Self { llm, max_attempts, prompt_opts }
    }

    /// Drive recovery after an initial execution failure. At most
    /// `max_attempts` LLM calls and executions happen here; a permission
    /// failure at any point ends the run immediately.
    pub async fn run(
        &self,
        executor: &dyn SqlExecutor,
        user_query: &str,
        catalog: &AggregatedCatalog,
        failed_sql: &str,
        category: ErrorCategory,
        engine_message: &str,
    ) -> RecoveryRun {
        let mut history: Vec<RecoveryAttempt> = Vec::new();
        let mut current_sql = failed_sql.to_string();
        let mut current_category = category;
        let mut current_message = engine_message.to_string();

        if !category.is_recoverable() {
            return RecoveryRun {
                result: Err(Error::PermissionDenied(engine_message.to_string())),
                history,
            };
        }

        for attempt_no in 1..=self.max_attempts {
            let started_at = Utc::now();
            let prompt = recovery_prompt(
                &RecoveryPromptRequest {
                    user_query,
                    failed_sql: &current_sql,
                    engine_message: &current_message,
                    category: current_category,
                    attempt_no,
                    catalog,
                },
                &self.prompt_opts,
            );
            tracing::debug!(target = "pipeline", attempt_no, category = %current_category, "recovery attempt");

            let response = match self.llm.generate(&prompt).await {
                Ok(text) => text,
                Err(e) => {
                    history.push(RecoveryAttempt {
                        attempt_no,
                        category: current_category,
                        input_sql: current_sql.clone(),
                        output_sql: None,
                        succeeded: false,
                        engine_message: Some(format!("llm call failed: {e}")),
                        started_at,
                        finished_at: Utc::now(),
                    });
                    return RecoveryRun { result: Err(e), history };
                }
            };

            let generated = match parse_llm_response(&response) {
                Ok(g) => g,
                Err(e) => {
                    history.push(RecoveryAttempt {
                        attempt_no,
                        category: current_category,
                        input_sql: current_sql.clone(),
                        output_sql: None,
                        succeeded: false,
                        engine_message: Some(format!("parse failure: {e}")),
                        started_at,
                        finished_at: Utc::now(),
                    });
                    current_message = "parse failure".to_string();
                    continue;
                }
            };

            if let Err(reason) = schema_validate(catalog, &generated.sql, current_category) {
                history.push(RecoveryAttempt {
                    attempt_no,
                    category: current_category,
                    input_sql: current_sql.clone(),
                    output_sql: Some(generated.sql.clone()),
                    succeeded: false,
                    engine_message: Some(reason.clone()),
                    started_at,
                    finished_at: Utc::now(),
                });
                current_message = format!("{current_message}; correction rejected: {reason}");
                continue;
            }

            match executor.execute(&generated.sql).await {
                Ok(ExecutionOutcome::Completed(rows)) => {
                    history.push(RecoveryAttempt {
                        attempt_no,
                        category: current_category,
                        input_sql: current_sql,
                        output_sql: Some(generated.sql.clone()),
                        succeeded: true,
                        engine_message: None,
                        started_at,
                        finished_at: Utc::now(),
                    });
                    return RecoveryRun { result: Ok((generated, rows)), history };
                }
                Ok(ExecutionOutcome::Failed { engine_message, category, .. }) => {
                    history.push(RecoveryAttempt {
                        attempt_no,
                        category: current_category,
                        input_sql: current_sql.clone(),
                        output_sql: Some(generated.sql.clone()),
                        succeeded: false,
                        engine_message: Some(engine_message.clone()),
                        started_at,
                        finished_at: Utc::now(),
                    });
                    if !category.is_recoverable() {
                        return RecoveryRun {
                            result: Err(Error::PermissionDenied(engine_message)),
                            history,
                        };
                    }
                    current_sql = generated.sql;
                    current_category = category;
                    current_message = engine_message;
                }
                Err(e) => {
                    history.push(RecoveryAttempt {
                        attempt_no,
                        category: current_category,
                        input_sql: current_sql.clone(),
                        output_sql: Some(generated.sql.clone()),
                        succeeded: false,
                        engine_message: Some(e.to_string()),
                        started_at,
                        finished_at: Utc::now(),
                    });
                    return RecoveryRun { result: Err(e), history };
                }
            }
        }

        RecoveryRun {
            result: Err(Error::RecoveryExhausted {
                attempts: self.max_attempts,
                last_error: current_message,
            }),
            history,
        }
    }
}

/// Schema-aware gate for corrected SQL. Missing-table rounds require every
/// FROM/JOIN identifier to be a known table; missing-column rounds require
/// every qualified column to exist under its (alias-resolved) table.
pub fn schema_validate(
    catalog: &AggregatedCatalog,
    sql: &str,
    category: ErrorCategory,
) -> Result<(), String> {
    match category {
        ErrorCategory::MissingTable => {
            let known: Vec<String> = catalog.tables().into_iter().map(|t| t.name).collect();
            if known.is_empty() {
                return Ok(());
            }
            for table in referenced_tables(sql) {
                if !catalog.has_table(&table.name) {
                    return Err(format!(
                        "table '{}' is not in the schema; known tables: {}",
                        table.name,
                        known.join(", ")
                    ));
                }
            }
            Ok(())
        }
        ErrorCategory::MissingColumn => {
            let refs = referenced_tables(sql);
            for (qualifier, column) in qualified_columns(sql) {
                // Resolve an alias back to its table; a bare table name
                // qualifies as its own resolution.
                let table_name = refs
                    .iter()
                    .find(|r| {
                        r.alias.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(&qualifier))
                            || r.name.eq_ignore_ascii_case(&qualifier)
                    })
                    .map(|r| r.name.clone());
                let Some(table_name) = table_name else { continue };
                if let Some(table) = catalog.table(&table_name)
                    && !table.columns.is_empty()
                    && !table.has_column(&column)
                {
                    return Err(format!(
                        "column '{column}' does not exist on table '{}'; its columns are: {}",
                        table.name,
                        table.columns.join(", ")
                    ));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Categorize a failed tool payload into an execution outcome.
pub fn failure_outcome(engine_message: String, raw: Option<serde_json::Value>) -> ExecutionOutcome {
    let (category, confidence) = categorize(&engine_message);
    tracing::debug!(target = "pipeline", category = %category, confidence, "execution failure categorized");
    ExecutionOutcome::Failed { engine_message, category, raw }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::catalog::CatalogServer;
    use crate::resources::{ResourceEntry, ResourceSnapshot, metadata_hash};

    fn schema_catalog() -> AggregatedCatalog {
        let payload = serde_json::json!({
            "tables": [
                { "name": "sales", "columns": ["id", "product_id", "total", "sold_at"] },
                { "name": "products", "columns": ["id", "name"] }
            ]
        });
        let mut entries = BTreeMap::new();
        entries.insert(
            "db://schema".to_string(),
            ResourceEntry {
                server_id: "db".into(),
                uri: "db://schema".into(),
                name: "schema".into(),
                mime_type: Some("application/json".into()),
                description: None,
                payload,
            },
        );
        let hash = metadata_hash(&entries);
        AggregatedCatalog::new(vec![CatalogServer {
            id: "db".into(),
            display_name: "DB".into(),
            priority: 1,
            domains: vec!["database".into()],
            capabilities: vec!["list_resources".into(), "execute_query".into()],
            snapshot: Arc::new(ResourceSnapshot {
                server_id: "db".into(),
                entries,
                fetched_at: tokio::time::Instant::now(),
                fetched_at_utc: Utc::now(),
                fetch_duration: Duration::from_millis(1),
                metadata_hash: hash,
            }),
        }])
    }

    struct ScriptedLlm {
        responses: Mutex<Vec<String>>,
        calls: Mutex<u32>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, _prompt: &str) -> Result<String, Error> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(Error::PromptGeneration("script exhausted".into()));
            }
            Ok(responses.remove(0))
        }
    }

    struct ScriptedExecutor {
        outcomes: Mutex<Vec<ExecutionOutcome>>,
        executions: Mutex<u32>,
    }

    impl ScriptedExecutor {
        fn new(outcomes: Vec<ExecutionOutcome>) -> Self {
            Self { outcomes: Mutex::new(outcomes), executions: Mutex::new(0) }
        }

        fn executions(&self) -> u32 {
            *self.executions.lock().unwrap()
        }
    }

    #[async_trait]
    impl SqlExecutor for ScriptedExecutor {
        async fn execute(&self, _sql: &str) -> Result<ExecutionOutcome, Error> {
            *self.executions.lock().unwrap() += 1;
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                return Err(Error::NoExecutorAvailable);
            }
            Ok(outcomes.remove(0))
        }
    }

    fn ok_rows() -> ExecutionOutcome {
        ExecutionOutcome::Completed(QueryRows {
            columns: vec!["total".into()],
            rows: vec![vec![serde_json::json!(10)]],
            row_count: 1,
            truncated: false,
            total_rows: None,
        })
    }

    fn fail(msg: &str) -> ExecutionOutcome {
        failure_outcome(msg.to_string(), None)
    }

    fn engine(llm: Arc<ScriptedLlm>) -> RecoveryEngine {
        RecoveryEngine::new(llm, 3, PromptOptions::default())
    }

    #[tokio::test]
    async fn first_attempt_can_succeed() {
        let llm = ScriptedLlm::new(vec![r#"{"sql_query": "SELECT total FROM sales"}"#]);
        let executor = ScriptedExecutor::new(vec![ok_rows()]);
        let run = engine(llm.clone())
            .run(
                &executor,
                "total sales",
                &schema_catalog(),
                "SELECT total FORM sales",
                ErrorCategory::SyntaxError,
                "syntax error at or near 'FORM'",
            )
            .await;
        let (generated, rows) = run.result.unwrap();
        assert_eq!(generated.sql, "SELECT total FROM sales");
        assert_eq!(rows.row_count, 1);
        assert_eq!(run.history.len(), 1);
        assert!(run.history[0].succeeded);
        assert_eq!(run.history[0].attempt_no, 1);
        assert_eq!(llm.calls(), 1);
        assert_eq!(executor.executions(), 1);
    }

    #[tokio::test]
    async fn permission_failure_stops_without_retry() {
        let llm = ScriptedLlm::new(vec![]);
        let executor = ScriptedExecutor::new(vec![]);
        let run = engine(llm.clone())
            .run(
                &executor,
                "q",
                &schema_catalog(),
                "SELECT x FROM sensitive",
                ErrorCategory::PermissionError,
                "permission denied for relation sensitive",
            )
            .await;
        assert_eq!(run.result.unwrap_err().code(), "permission_denied");
        assert!(run.history.is_empty());
        assert_eq!(llm.calls(), 0);
        assert_eq!(executor.executions(), 0);
    }

    #[tokio::test]
    async fn permission_during_recovery_is_terminal() {
        let llm = ScriptedLlm::new(vec![
            r#"{"sql_query": "SELECT total FROM sales"}"#,
            r#"{"sql_query": "SELECT total FROM sales"}"#,
        ]);
        let executor = ScriptedExecutor::new(vec![fail("permission denied for relation sales")]);
        let run = engine(llm.clone())
            .run(
                &executor,
                "q",
                &schema_catalog(),
                "SELECT totl FROM sales",
                ErrorCategory::MissingColumn,
                "column \"totl\" does not exist",
            )
            .await;
        assert_eq!(run.result.unwrap_err().code(), "permission_denied");
        assert_eq!(run.history.len(), 1);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn exhaustion_after_max_attempts() {
        let llm = ScriptedLlm::new(vec![
            r#"{"sql_query": "SELECT a FROM sales"}"#,
            r#"{"sql_query": "SELECT b FROM sales"}"#,
            r#"{"sql_query": "SELECT c FROM sales"}"#,
        ]);
        let executor = ScriptedExecutor::new(vec![
            fail("column \"a\" does not exist"),
            fail("column \"b\" does not exist"),
            fail("column \"c\" does not exist"),
        ]);
        let run = engine(llm.clone())
            .run(
                &executor,
                "q",
                &schema_catalog(),
                "SELECT z FROM sales",
                ErrorCategory::MissingColumn,
                "column \"z\" does not exist",
            )
            .await;
        match run.result.unwrap_err() {
            Error::RecoveryExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("\"c\""));
            }
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(run.history.len(), 3);
        assert_eq!(
            run.history.iter().map(|a| a.attempt_no).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(llm.calls(), 3);
        assert_eq!(executor.executions(), 3);
    }

    #[tokio::test]
    async fn parse_failure_consumes_an_attempt() {
        let llm = ScriptedLlm::new(vec![
            "cannot help with that",
            r#"{"sql_query": "SELECT total FROM sales"}"#,
        ]);
        let executor = ScriptedExecutor::new(vec![ok_rows()]);
        let run = engine(llm.clone())
            .run(
                &executor,
                "q",
                &schema_catalog(),
                "SELECT total FORM sales",
                ErrorCategory::SyntaxError,
                "syntax error",
            )
            .await;
        assert!(run.result.is_ok());
        assert_eq!(run.history.len(), 2);
        assert!(!run.history[0].succeeded);
        assert!(run.history[0].engine_message.as_deref().unwrap().contains("parse failure"));
        assert!(run.history[1].succeeded);
        assert_eq!(executor.executions(), 1);
    }

    #[tokio::test]
    async fn missing_table_correction_is_schema_checked() {
        // First correction still references an unknown table and is rejected
        // before execution; the second passes and runs.
        let llm = ScriptedLlm::new(vec![
            r#"{"sql_query": "SELECT total FROM sale"}"#,
            r#"{"sql_query": "SELECT total FROM sales"}"#,
        ]);
        let executor = ScriptedExecutor::new(vec![ok_rows()]);
        let run = engine(llm.clone())
            .run(
                &executor,
                "q",
                &schema_catalog(),
                "SELECT total FROM sale",
                ErrorCategory::MissingTable,
                "table 'sale' does not exist",
            )
            .await;
        assert!(run.result.is_ok());
        assert_eq!(run.history.len(), 2);
        assert!(run.history[0].engine_message.as_deref().unwrap().contains("not in the schema"));
        assert_eq!(executor.executions(), 1);
    }

    #[test]
    fn schema_validate_missing_column_uses_aliases() {
        let catalog = schema_catalog();
        assert!(
            schema_validate(
                &catalog,
                "SELECT s.total FROM sales s",
                ErrorCategory::MissingColumn
            )
            .is_ok()
        );
        let err = schema_validate(
            &catalog,
            "SELECT s.revenue FROM sales s",
            ErrorCategory::MissingColumn,
        )
        .unwrap_err();
        assert!(err.contains("revenue"));
        assert!(err.contains("sales"));
    }

    #[test]
    fn schema_validate_other_categories_pass() {
        let catalog = schema_catalog();
        assert!(
            schema_validate(&catalog, "SELECT x FROM unknown_t", ErrorCategory::SyntaxError).is_ok()
        );
    }
}
