use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::categorize::ErrorCategory;

// Shared tool descriptor, as advertised by a subordinate server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

// Resource listing entry, prior to reading its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One term the LLM mapped from the user's wording onto catalog metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub original_term: String,
    pub resolved_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_server: Option<String>,
    #[serde(default = "default_entity_confidence")]
    pub confidence: f64,
}

fn default_entity_confidence() -> f64 {
    1.0
}

/// SQL produced by a generation or recovery round, with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub resolved_entities: Vec<ResolvedEntity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes_made: Vec<String>,
}

/// Tabular payload returned by the executor tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    #[serde(default)]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<usize>,
}

/// Outcome of one execution attempt. A tagged value, not an error channel:
/// failures flow into categorization and recovery instead of unwinding.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed(QueryRows),
    Failed {
        engine_message: String,
        category: ErrorCategory,
        raw: Option<serde_json::Value>,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed(_))
    }
}

/// Record of one recovery round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub attempt_no: u32,
    pub category: ErrorCategory,
    pub input_sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_sql: Option<String>,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub performed: bool,
    pub attempts: u32,
    pub history: Vec<RecoveryAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub servers_used: Vec<String>,
    pub elapsed_ms: u64,
}

/// The single value emitted to the caller for every processed query,
/// successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    pub user_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<QueryRows>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
    pub resolved_entities: Vec<ResolvedEntity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub recovery: RecoveryReport,
    pub metadata: QueryMetadata,
}

/// Per-request knobs accepted by the orchestrator entry point.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub enable_recovery: Option<bool>,
    pub deadline: Option<tokio::time::Instant>,
}

impl QueryOptions {
    pub fn recovery_enabled(&self) -> bool {
        self.enable_recovery.unwrap_or(true)
    }
}

/// Registry view of one configured server, as returned by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatusView {
    pub id: String,
    pub display_name: String,
    pub state: String,
    pub priority: u16,
    pub tools: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
