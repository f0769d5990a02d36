//! Deterministic prompt assembly. Identical inputs render byte-identical
//! prompts: map keys are sorted, truncation is stable, nothing depends on
//! wall-clock state.

use crate::catalog::AggregatedCatalog;
use crate::categorize::ErrorCategory;

pub const DEFAULT_MAX_ITEMS: usize = 40;

#[derive(Debug, Clone)]
pub struct PromptOptions {
    /// Per-array and per-map element cap in catalog renderings.
    pub max_items: usize,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self { max_items: DEFAULT_MAX_ITEMS }
    }
}

const RESPONSE_SCHEMA: &str = r#"{
  "sql_query": "the SELECT statement",
  "resolved_entities": [
    {
      "original_term": "term as the user wrote it",
      "resolved_value": "value or expression it was mapped to",
      "source_server": "id of the server whose metadata resolved it",
      "confidence": 0.0
    }
  ],
  "explanation": "one short paragraph describing what the query computes"
}"#;

const RECOVERY_SCHEMA: &str = r#"{
  "sql_query": "the corrected SELECT statement",
  "resolved_entities": [
    {
      "original_term": "term as the user wrote it",
      "resolved_value": "value or expression it was mapped to",
      "source_server": "id of the server whose metadata resolved it",
      "confidence": 0.0
    }
  ],
  "explanation": "one short paragraph describing what the query computes",
  "changes_made": ["each concrete change applied to the failed query"]
}"#;

/// Build the initial SQL generation prompt.
pub fn generation_prompt(
    user_query: &str,
    catalog: &AggregatedCatalog,
    opts: &PromptOptions,
) -> String {
    let mut out = String::new();
    out.push_str("You translate natural-language questions into a single read-only SQL query.\n\n");
    out.push_str("User question:\n");
    out.push_str(user_query.trim());
    out.push_str("\n\n");
    out.push_str("Available data sources, in priority order:\n\n");
    out.push_str(&render_catalog(catalog, opts, false));
    out.push_str("\nInstructions:\n");
    out.push_str(
        "1. Resolve product names, aliases and other business terms using the metadata above; \
         prefer entries from higher-priority servers.\n\
         2. Map user-friendly wording (time ranges, friendly column names) onto the actual \
         columns and expressions the schemas define.\n\
         3. Produce exactly one SELECT statement. Never write INSERT, UPDATE, DELETE, DROP, \
         ALTER, CREATE, TRUNCATE, GRANT, REVOKE or MERGE.\n\
         4. Record every mapping you applied in resolved_entities, naming the server the \
         metadata came from.\n\
         5. Explain the query in plain language in the explanation field.\n",
    );
    out.push_str("\nRespond with a JSON object of this exact shape:\n");
    out.push_str(RESPONSE_SCHEMA);
    out.push('\n');
    out
}

/// Inputs for a recovery round prompt.
#[derive(Debug, Clone)]
pub struct RecoveryPromptRequest<'a> {
    pub user_query: &'a str,
    pub failed_sql: &'a str,
    pub engine_message: &'a str,
    pub category: ErrorCategory,
    pub attempt_no: u32,
    pub catalog: &'a AggregatedCatalog,
}

/// Build the error-recovery prompt. Schema sections lead the catalog
/// rendering so table and column names are in front of the model.
pub fn recovery_prompt(req: &RecoveryPromptRequest<'_>, opts: &PromptOptions) -> String {
    let mut out = String::new();
    out.push_str("A generated SQL query failed to execute and must be corrected.\n\n");
    out.push_str("Original user question:\n");
    out.push_str(req.user_query.trim());
    out.push_str("\n\nFailed SQL:\n");
    out.push_str(req.failed_sql.trim());
    out.push_str("\n\nDatabase error:\n");
    out.push_str(req.engine_message.trim());
    out.push_str("\n\nError category: ");
    out.push_str(req.category.as_str());
    out.push_str("\n\n");
    out.push_str(&render_catalog(req.catalog, opts, true));
    out.push_str("\nHow to fix it:\n");
    out.push_str(fix_instructions(req.category));
    out.push('\n');
    if req.attempt_no > 1 {
        out.push_str(
            "\nEarlier corrections also failed. Re-read the schema carefully, change only what \
             the error demands, and double-check every table and column name against the listings \
             above before answering.\n",
        );
    }
    out.push_str("\nRespond with a JSON object of this exact shape:\n");
    out.push_str(RECOVERY_SCHEMA);
    out.push('\n');
    out
}

fn fix_instructions(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::SyntaxError => {
            "Fix the SQL syntax. Check keyword spelling, clause order, commas and quoting; \
             rewrite the statement so it parses."
        }
        ErrorCategory::MissingColumn => {
            "A referenced column does not exist. Pick the correct column from the table \
             listings above; do not invent names."
        }
        ErrorCategory::MissingTable => {
            "A referenced table does not exist. Use only tables from the listings above, \
             matching their exact spelling."
        }
        ErrorCategory::DataTypeMismatch => {
            "Operand types do not match. Add the appropriate casts or compare against values \
             of the column's declared type."
        }
        ErrorCategory::AmbiguousColumn => {
            "A column reference is ambiguous. Qualify every such column with its table name \
             or alias."
        }
        ErrorCategory::AggregationError => {
            "The aggregation is malformed. Every non-aggregated selected column must appear \
             in GROUP BY, and aggregate calls must not be nested."
        }
        ErrorCategory::PermissionError => {
            "The database rejected the query for lack of privileges. Query only objects the \
             role can read."
        }
        ErrorCategory::UnknownError => {
            "Re-read the error message and the schema listings, then rewrite the query so the \
             reported problem cannot occur."
        }
    }
}

// Per-server blocks, priority order. With schema_first, table listings come
// before the resource JSON so they survive truncation-prone renderings.
fn render_catalog(catalog: &AggregatedCatalog, opts: &PromptOptions, schema_first: bool) -> String {
    let mut out = String::new();
    if schema_first {
        let tables = catalog.tables();
        if !tables.is_empty() {
            out.push_str("Known tables and columns:\n");
            for table in &tables {
                out.push_str("  - ");
                out.push_str(&table.name);
                out.push_str(" (");
                out.push_str(&table.columns.join(", "));
                out.push_str(")\n");
            }
            out.push('\n');
        }
    }
    for server in catalog.servers() {
        out.push_str(&format!(
            "### {} (id: {}, priority: {})\n",
            server.display_name, server.id, server.priority
        ));
        out.push_str(&format!("domains: [{}]\n", server.domains.join(", ")));
        out.push_str(&format!("capabilities: [{}]\n", server.capabilities.join(", ")));
        if server.snapshot.entries.is_empty() {
            out.push_str("resources: none\n\n");
            continue;
        }
        out.push_str("resources:\n");
        for (uri, entry) in &server.snapshot.entries {
            let rendered = render_truncated(&entry.payload, opts.max_items);
            out.push_str(&format!("- {uri}:\n{rendered}\n"));
        }
        out.push('\n');
    }
    out
}

/// Render a payload as pretty JSON with every array and map capped at
/// `max_items` elements. Oversized containers carry a `…` marker with the
/// count of elided items.
pub fn render_truncated(value: &serde_json::Value, max_items: usize) -> String {
    let mut truncated = false;
    let capped = truncate_value(value, max_items, &mut truncated);
    if truncated {
        tracing::warn!(target = "pipeline", max_items, "resource payload truncated in prompt");
    }
    serde_json::to_string_pretty(&capped).unwrap_or_else(|_| "null".to_string())
}

fn truncate_value(value: &serde_json::Value, max_items: usize, truncated: &mut bool) -> serde_json::Value {
    match value {
        serde_json::Value::Array(items) => {
            let mut out: Vec<serde_json::Value> = items
                .iter()
                .take(max_items)
                .map(|v| truncate_value(v, max_items, truncated))
                .collect();
            if items.len() > max_items {
                *truncated = true;
                out.push(serde_json::Value::String(format!(
                    "… ({} more items)",
                    items.len() - max_items
                )));
            }
            serde_json::Value::Array(out)
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map.iter().take(max_items) {
                out.insert(k.clone(), truncate_value(v, max_items, truncated));
            }
            if map.len() > max_items {
                *truncated = true;
                out.insert(
                    "…".to_string(),
                    serde_json::Value::String(format!("({} more items)", map.len() - max_items)),
                );
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    }
}
