//! Configuration schema, loading, and validation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CACHE_TTL_S: u64 = 3600;
pub const DEFAULT_REFRESH_INTERVAL_S: u64 = 1800;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    Sse,
    Stdio,
    Http,
}

/// Transport-specific endpoint settings. One struct covers all three
/// variants; `validate` enforces which fields each transport requires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Immutable per-server metadata from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub critical: bool,
    pub priority: u16,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub transport: TransportType,
    #[serde(default)]
    pub transport_config: TransportConfig,
}

impl ServerDescriptor {
    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }

    pub fn has_domain(&self, needle: &str) -> bool {
        self.domains.iter().any(|d| d.to_lowercase().contains(needle))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
}

impl Defaults {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orchestration {
    #[serde(default = "default_cache_ttl")]
    pub resource_cache_ttl_s: u64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_s: u64,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

impl Default for Orchestration {
    fn default() -> Self {
        Self {
            resource_cache_ttl_s: DEFAULT_CACHE_TTL_S,
            refresh_interval_s: DEFAULT_REFRESH_INTERVAL_S,
            fail_fast: true,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
        }
    }
}

impl Orchestration {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.resource_cache_ttl_s)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_s)
    }
}

/// Settings for the bundled HTTP LLM client. Optional: the orchestrator
/// itself only sees the `LlmClient` trait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub orchestration: Orchestration,
    pub servers: Vec<ServerDescriptor>,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
}

fn default_true() -> bool {
    true
}
fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_S
}
fn default_refresh_interval() -> u64 {
    DEFAULT_REFRESH_INTERVAL_S
}
fn default_max_retry_attempts() -> u32 {
    DEFAULT_MAX_RETRY_ATTEMPTS
}
fn default_llm_endpoint() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}
fn default_llm_max_tokens() -> u32 {
    1024
}
fn default_llm_timeout_ms() -> u64 {
    60_000
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap()
    })
}

/// Replace `${VAR}` and `${VAR:-default}` occurrences in a single string
/// value. A missing variable without a default is a configuration error.
fn substitute_str(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in env_var_pattern().captures_iter(input) {
        let whole = caps.get(0).unwrap();
        out.push_str(&input[last..whole.start()]);
        let var = &caps[1];
        match lookup(var) {
            Some(v) => out.push_str(&v),
            None => match caps.get(2) {
                Some(default) => out.push_str(default.as_str()),
                None => {
                    return Err(Error::Configuration(format!(
                        "environment variable '{var}' is not set and has no default"
                    )));
                }
            },
        }
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

// Walk every string value of the parsed document and substitute in place.
fn substitute_value(
    value: &mut serde_json::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<()> {
    match value {
        serde_json::Value::String(s) => {
            *s = substitute_str(s, lookup)?;
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_value(item, lookup)?;
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_value(v, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Parse a configuration document from text. `yaml` selects the parser;
/// substitution runs before validation in both cases.
pub fn parse_config_with(
    content: &str,
    yaml: bool,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut doc: serde_json::Value = if yaml {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Configuration(format!("invalid yaml: {e}")))?
    } else {
        serde_json::from_str(content)
            .map_err(|e| Error::Configuration(format!("invalid json: {e}")))?
    };
    substitute_value(&mut doc, lookup)?;
    let config: Config = serde_json::from_value(doc)
        .map_err(|e| Error::Configuration(format!("invalid schema: {e}")))?;
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str, yaml: bool) -> Result<Config> {
    parse_config_with(content, yaml, &|var| std::env::var(var).ok())
}

/// Load a configuration file, choosing the parser by extension.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Configuration(format!("read {}: {e}", path.display())))?;
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    parse_config(&content, yaml)
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9-]+$").unwrap())
}

pub fn validate(config: &Config) -> Result<()> {
    if config.version.trim().is_empty() {
        return Err(Error::Configuration("version is required".into()));
    }
    if config.servers.is_empty() {
        return Err(Error::Configuration("at least one server is required".into()));
    }
    let mut seen = std::collections::HashSet::new();
    for server in &config.servers {
        if !id_pattern().is_match(&server.id) {
            return Err(Error::Configuration(format!(
                "server id '{}' must match ^[a-z0-9-]+$",
                server.id
            )));
        }
        if !seen.insert(server.id.clone()) {
            return Err(Error::Configuration(format!("duplicate server id '{}'", server.id)));
        }
        if !(1..=999).contains(&server.priority) {
            return Err(Error::Configuration(format!(
                "server '{}': priority {} out of range 1..=999",
                server.id, server.priority
            )));
        }
        if !server.has_capability("list_resources") {
            return Err(Error::Configuration(format!(
                "server '{}': capabilities must include list_resources",
                server.id
            )));
        }
        match server.transport {
            TransportType::Sse | TransportType::Http => {
                if server
                    .transport_config
                    .endpoint
                    .as_deref()
                    .is_none_or(|e| e.trim().is_empty())
                {
                    return Err(Error::Configuration(format!(
                        "server '{}': {} transport requires an endpoint",
                        server.id,
                        if server.transport == TransportType::Sse { "sse" } else { "http" }
                    )));
                }
            }
            TransportType::Stdio => {
                if server
                    .transport_config
                    .command
                    .as_deref()
                    .is_none_or(|c| c.trim().is_empty())
                {
                    return Err(Error::Configuration(format!(
                        "server '{}': stdio transport requires a command",
                        server.id
                    )));
                }
            }
        }
    }
    if config.orchestration.resource_cache_ttl_s == 0 {
        return Err(Error::Configuration("resource_cache_ttl_s must be positive".into()));
    }
    if config.orchestration.refresh_interval_s == 0 {
        return Err(Error::Configuration("refresh_interval_s must be positive".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |var: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == var)
                .map(|(_, v)| (*v).to_string())
        }
    }

    fn minimal_json(extra_server_fields: &str) -> String {
        format!(
            r#"{{
              "version": "1.0",
              "servers": [
                {{
                  "id": "metadata-server",
                  "name": "Metadata",
                  "priority": 1,
                  "domains": ["product", "metadata"],
                  "capabilities": ["list_resources"],
                  "transport": "http",
                  "transport_config": {{ "endpoint": "http://127.0.0.1:9000/mcp" }}
                  {extra_server_fields}
                }}
              ]
            }}"#
        )
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = parse_config_with(&minimal_json(""), false, &|_| None).unwrap();
        assert_eq!(cfg.version, "1.0");
        assert_eq!(cfg.orchestration.resource_cache_ttl_s, 3600);
        assert_eq!(cfg.orchestration.refresh_interval_s, 1800);
        assert!(cfg.orchestration.fail_fast);
        assert_eq!(cfg.orchestration.max_retry_attempts, 3);
        let s = &cfg.servers[0];
        assert!(s.enabled);
        assert!(!s.critical);
        assert!(s.has_domain("product"));
    }

    #[test]
    fn yaml_parses_too() {
        let yaml = r#"
version: "1.0"
orchestration:
  fail_fast: false
servers:
  - id: db
    name: Database
    priority: 10
    domains: [database]
    capabilities: [list_resources, execute_query]
    transport: stdio
    transport_config:
      command: db-mcp
      args: ["--readonly"]
"#;
        let cfg = parse_config_with(yaml, true, &|_| None).unwrap();
        assert!(!cfg.orchestration.fail_fast);
        assert_eq!(cfg.servers[0].transport, TransportType::Stdio);
        assert!(cfg.servers[0].has_capability("execute_query"));
    }

    #[test]
    fn env_substitution_with_and_without_default() {
        let lookup = lookup_from(&[("TOKEN", "s3cr3t")]);
        assert_eq!(substitute_str("Bearer ${TOKEN}", &lookup).unwrap(), "Bearer s3cr3t");
        assert_eq!(
            substitute_str("${MISSING:-fallback}", &lookup).unwrap(),
            "fallback"
        );
        assert_eq!(
            substitute_str("a ${TOKEN} b ${MISSING:-c} d", &lookup).unwrap(),
            "a s3cr3t b c d"
        );
        let err = substitute_str("${MISSING}", &lookup).unwrap_err();
        assert_eq!(err.code(), "configuration");
    }

    #[test]
    fn substitution_applies_inside_nested_values() {
        let json = r#"{
          "version": "1.0",
          "servers": [{
            "id": "api",
            "name": "Api",
            "priority": 5,
            "capabilities": ["list_resources"],
            "transport": "http",
            "transport_config": {
              "endpoint": "${API_URL}",
              "headers": { "authorization": "Bearer ${API_KEY:-anon}" }
            }
          }]
        }"#;
        let lookup = lookup_from(&[("API_URL", "https://example.test/mcp")]);
        let cfg = parse_config_with(json, false, &lookup).unwrap();
        let tc = &cfg.servers[0].transport_config;
        assert_eq!(tc.endpoint.as_deref(), Some("https://example.test/mcp"));
        assert_eq!(tc.headers["authorization"], "Bearer anon");
    }

    #[test]
    fn unresolved_variable_is_a_config_error() {
        let json = minimal_json("").replace("http://127.0.0.1:9000/mcp", "${NOPE}");
        let err = parse_config_with(&json, false, &|_| None).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }

    #[test]
    fn rejects_bad_ids_and_duplicates() {
        let bad = minimal_json("").replace("metadata-server", "Meta_Server");
        assert!(parse_config_with(&bad, false, &|_| None).is_err());

        let dup = r#"{
          "version": "1.0",
          "servers": [
            {"id":"a","name":"A","priority":1,"capabilities":["list_resources"],
             "transport":"http","transport_config":{"endpoint":"http://x/mcp"}},
            {"id":"a","name":"A2","priority":2,"capabilities":["list_resources"],
             "transport":"http","transport_config":{"endpoint":"http://y/mcp"}}
          ]
        }"#;
        let err = parse_config_with(dup, false, &|_| None).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_priority_out_of_range() {
        let json = minimal_json("").replace("\"priority\": 1,", "\"priority\": 1000,");
        assert!(parse_config_with(&json, false, &|_| None).is_err());
    }

    #[test]
    fn rejects_missing_transport_fields() {
        let json = r#"{
          "version": "1.0",
          "servers": [{
            "id": "db", "name": "Db", "priority": 1,
            "capabilities": ["list_resources"],
            "transport": "stdio",
            "transport_config": {}
          }]
        }"#;
        let err = parse_config_with(json, false, &|_| None).unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn requires_list_resources_capability() {
        let json = minimal_json("").replace("\"list_resources\"", "\"execute_query\"");
        let err = parse_config_with(&json, false, &|_| None).unwrap_err();
        assert!(err.to_string().contains("list_resources"));
    }

    #[test]
    fn requires_at_least_one_server() {
        let json = r#"{"version": "1.0", "servers": []}"#;
        assert!(parse_config_with(json, false, &|_| None).is_err());
    }
}
