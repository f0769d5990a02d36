//! Shared in-memory doubles for pipeline integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mcp_conductor_core::client::{ClientConnector, McpClient, ToolOutput};
use mcp_conductor_core::config::{
    Config, Defaults, Orchestration, ServerDescriptor, TransportConfig, TransportType,
};
use mcp_conductor_core::error::{Error, TransportError};
use mcp_conductor_core::llm::LlmClient;
use mcp_conductor_core::orchestrator::Orchestrator;
use mcp_conductor_core::types::{ResourceMeta, ToolInfo};

/// One scripted outcome for the execute_query tool.
#[derive(Clone)]
pub enum ExecScript {
    Rows(serde_json::Value),
    EngineError(String),
}

pub struct MockClient {
    resources: Vec<(String, serde_json::Value)>,
    tools: Vec<ToolInfo>,
    exec: Mutex<VecDeque<ExecScript>>,
    pub exec_calls: AtomicU32,
}

impl MockClient {
    pub fn new(resources: Vec<(String, serde_json::Value)>, tools: Vec<ToolInfo>) -> Arc<Self> {
        Arc::new(Self {
            resources,
            tools,
            exec: Mutex::new(VecDeque::new()),
            exec_calls: AtomicU32::new(0),
        })
    }

    pub fn script(&self, outcomes: Vec<ExecScript>) {
        *self.exec.lock().unwrap() = outcomes.into();
    }

    pub fn executions(&self) -> u32 {
        self.exec_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpClient for MockClient {
    fn protocol_version(&self) -> Option<String> {
        Some("2025-03-26".into())
    }

    fn server_version(&self) -> Option<String> {
        Some("0.0.0-test".into())
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, TransportError> {
        Ok(self.tools.clone())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceMeta>, TransportError> {
        Ok(self
            .resources
            .iter()
            .map(|(uri, _)| ResourceMeta {
                uri: uri.clone(),
                name: uri.clone(),
                description: None,
                mime_type: Some("application/json".into()),
            })
            .collect())
    }

    async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, TransportError> {
        self.resources
            .iter()
            .find(|(u, _)| u == uri)
            .map(|(_, payload)| payload.clone())
            .ok_or_else(|| TransportError::protocol(format!("unknown uri {uri}")))
    }

    async fn call_tool(
        &self,
        name: &str,
        _arguments: serde_json::Value,
    ) -> Result<ToolOutput, TransportError> {
        if name != "execute_query" {
            return Err(TransportError::protocol(format!("unknown tool {name}")));
        }
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.exec.lock().unwrap().pop_front();
        match outcome {
            Some(ExecScript::Rows(payload)) => Ok(ToolOutput { payload, is_error: false }),
            Some(ExecScript::EngineError(message)) => Ok(ToolOutput {
                payload: serde_json::json!({ "error": message }),
                is_error: true,
            }),
            None => Err(TransportError::protocol("no scripted outcome left")),
        }
    }

    async fn close(&self) {}
}

pub struct MockConnector {
    clients: Mutex<HashMap<String, Arc<MockClient>>>,
}

impl MockConnector {
    pub fn new(clients: Vec<(&str, Arc<MockClient>)>) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(
                clients.into_iter().map(|(id, c)| (id.to_string(), c)).collect(),
            ),
        })
    }
}

#[async_trait]
impl ClientConnector for MockConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn McpClient>, TransportError> {
        self.clients
            .lock()
            .unwrap()
            .get(&descriptor.id)
            .cloned()
            .map(|c| c as Arc<dyn McpClient>)
            .ok_or_else(|| TransportError::dial("connection refused"))
    }
}

pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    pub prompts: Mutex<Vec<String>>,
    calls: AtomicU32,
    delay: Option<std::time::Duration>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            delay: None,
        })
    }

    pub fn slow(responses: Vec<&str>, delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            delay: Some(delay),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(&self, prompt: &str) -> Result<String, Error> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        let next = self.responses.lock().unwrap().pop_front();
        next.ok_or_else(|| Error::PromptGeneration("llm script exhausted".into()))
    }
}

pub fn descriptor(id: &str, priority: u16, domains: &[&str], caps: &[&str]) -> ServerDescriptor {
    ServerDescriptor {
        id: id.into(),
        name: id.to_uppercase(),
        enabled: true,
        critical: false,
        priority,
        domains: domains.iter().map(|d| (*d).to_string()).collect(),
        capabilities: caps.iter().map(|c| (*c).to_string()).collect(),
        transport: TransportType::Http,
        transport_config: TransportConfig {
            endpoint: Some(format!("http://127.0.0.1:1/{id}")),
            ..Default::default()
        },
    }
}

pub fn config(servers: Vec<ServerDescriptor>) -> Config {
    Config {
        version: "1.0".into(),
        defaults: Defaults::default(),
        orchestration: Orchestration::default(),
        servers,
        llm: None,
    }
}

pub fn metadata_resources() -> Vec<(String, serde_json::Value)> {
    vec![
        (
            "metadata://products".to_string(),
            serde_json::json!({
                "products": [
                    { "name": "abracadabra", "product_id": 123 },
                    { "name": "widget", "product_id": 7 }
                ]
            }),
        ),
        (
            "metadata://column-mappings".to_string(),
            serde_json::json!({
                "mappings": [
                    {
                        "term": "this month",
                        "expression": "DATE_TRUNC('month', {date_column}) = DATE_TRUNC('month', CURRENT_DATE)"
                    }
                ]
            }),
        ),
    ]
}

pub fn schema_resources() -> Vec<(String, serde_json::Value)> {
    vec![(
        "db://schema/tables".to_string(),
        serde_json::json!({
            "tables": [
                { "name": "sales", "columns": ["id", "product_id", "total", "sold_at"] },
                { "name": "products", "columns": ["id", "name"] }
            ]
        }),
    )]
}

pub fn execute_tool() -> ToolInfo {
    ToolInfo {
        name: "execute_query".into(),
        description: Some("run a read-only query".into()),
        input_schema: Some(serde_json::json!({
            "type": "object",
            "properties": { "sql": { "type": "string" } }
        })),
    }
}

pub struct Fixture {
    pub orchestrator: Orchestrator,
    pub llm: Arc<ScriptedLlm>,
    pub db: Arc<MockClient>,
}

/// Standard two-server world: a metadata server (priority 1) and a database
/// executor (priority 10).
pub fn fixture(llm_responses: Vec<&str>, exec: Vec<ExecScript>) -> Fixture {
    let metadata = MockClient::new(metadata_resources(), vec![]);
    let db = MockClient::new(schema_resources(), vec![execute_tool()]);
    db.script(exec);
    let connector = MockConnector::new(vec![("metadata-server", metadata), ("db", db.clone())]);
    let llm = ScriptedLlm::new(llm_responses);
    let cfg = config(vec![
        descriptor("metadata-server", 1, &["product", "metadata"], &["list_resources"]),
        descriptor("db", 10, &["database"], &["list_resources", "execute_query"]),
    ]);
    let orchestrator = Orchestrator::new(&cfg, connector, llm.clone());
    Fixture { orchestrator, llm, db }
}

pub fn rows(columns: &[&str], rows: Vec<Vec<serde_json::Value>>) -> ExecScript {
    ExecScript::Rows(serde_json::json!({
        "columns": columns,
        "rows": rows,
    }))
}
