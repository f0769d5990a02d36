//! MCP transport clients: one capability set over sse, stdio, and http.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::ServiceExt;
use rmcp::model::{CallToolRequestParam, ReadResourceRequestParam, ResourceContents};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::{
    SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    sse_client::SseClientConfig,
    streamable_http_client::StreamableHttpClientTransportConfig,
};

use crate::config::{Defaults, ServerDescriptor, TransportType};
use crate::error::{TransportError, TransportErrorKind};
use crate::types::{ResourceMeta, ToolInfo};

const TRANSPORT_MAX_TRIES: u32 = 3;
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Result of one tool invocation, decoded from the MCP content envelope.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Structured payload when the server provided one, otherwise the first
    /// text content parsed as JSON, otherwise the raw text as a JSON string.
    pub payload: serde_json::Value,
    pub is_error: bool,
}

/// The one operation set every transport variant speaks.
#[async_trait]
pub trait McpClient: Send + Sync {
    fn protocol_version(&self) -> Option<String>;
    fn server_version(&self) -> Option<String>;
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, TransportError>;
    async fn list_resources(&self) -> Result<Vec<ResourceMeta>, TransportError>;
    async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, TransportError>;
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, TransportError>;
    /// Release transport resources. Idempotent.
    async fn close(&self);
}

/// Connection factory seam. The registry goes through this so tests can
/// substitute in-memory clients.
#[async_trait]
pub trait ClientConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn McpClient>, TransportError>;
}

type ClientService = RunningService<RoleClient, ()>;

/// rmcp-backed client. `initialize` happens inside `connect`; the negotiated
/// versions are read from the peer afterwards.
pub struct RmcpClient {
    service: ClientService,
}

impl RmcpClient {
    pub async fn connect(descriptor: &ServerDescriptor) -> Result<Self, TransportError> {
        let tc = &descriptor.transport_config;
        let service = match descriptor.transport {
            TransportType::Http => {
                let endpoint = tc
                    .endpoint
                    .clone()
                    .ok_or_else(|| TransportError::dial("no endpoint"))?;
                let client = http_client_with_headers(tc)?;
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(endpoint),
                );
                ().serve(transport)
                    .await
                    .map_err(|e| TransportError::dial(format!("rmcp serve: {e}")))?
            }
            TransportType::Sse => {
                let endpoint = tc
                    .endpoint
                    .clone()
                    .ok_or_else(|| TransportError::dial("no endpoint"))?;
                let client = http_client_with_headers(tc)?;
                let transport = SseClientTransport::start_with_client(
                    client,
                    SseClientConfig { sse_endpoint: endpoint.into(), ..Default::default() },
                )
                .await
                .map_err(|e| TransportError::dial(format!("sse start: {e}")))?;
                ().serve(transport)
                    .await
                    .map_err(|e| TransportError::dial(format!("rmcp serve: {e}")))?
            }
            TransportType::Stdio => {
                let cmd = tc
                    .command
                    .clone()
                    .ok_or_else(|| TransportError::dial("missing command"))?;
                let mut command = tokio::process::Command::new(cmd);
                command.args(&tc.args);
                for (k, v) in &tc.env {
                    command.env(k, v);
                }
                if let Some(cwd) = &tc.cwd {
                    command.current_dir(cwd);
                }
                let transport = TokioChildProcess::new(command)
                    .map_err(|e| TransportError::dial(format!("spawn: {e}")))?;
                ().serve(transport)
                    .await
                    .map_err(|e| TransportError::dial(format!("rmcp serve: {e}")))?
            }
        };
        Ok(Self { service })
    }
}

fn http_client_with_headers(
    tc: &crate::config::TransportConfig,
) -> Result<reqwest::Client, TransportError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (k, v) in &tc.headers {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .map_err(|_| TransportError::protocol(format!("invalid header name {k}")))?;
        let val = reqwest::header::HeaderValue::from_str(v)
            .map_err(|_| TransportError::protocol(format!("invalid header value for {k}")))?;
        map.insert(name, val);
    }
    if let Some(key) = &tc.api_key {
        let val = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|_| TransportError::protocol("invalid api key value"))?;
        map.insert(reqwest::header::AUTHORIZATION, val);
    }
    let mut builder = reqwest::Client::builder().default_headers(map);
    if let Some(timeout_ms) = tc.timeout_ms {
        builder = builder.timeout(Duration::from_millis(timeout_ms));
    }
    builder
        .build()
        .map_err(|e| TransportError::dial(format!("http client build: {e}")))
}

fn map_service_error(e: rmcp::ServiceError) -> TransportError {
    match &e {
        rmcp::ServiceError::Timeout { .. } => TransportError::timeout(e.to_string()),
        rmcp::ServiceError::Cancelled { .. } => TransportError::closed(e.to_string()),
        other => {
            // Transport-level breakage is reconnectable; protocol-level
            // surprises are not.
            let message = other.to_string();
            let lower = message.to_lowercase();
            if lower.contains("transport") || lower.contains("closed") {
                TransportError { kind: TransportErrorKind::Closed, message, retryable: true }
            } else {
                TransportError::protocol(message)
            }
        }
    }
}

// Decode one read payload: JSON text parses as JSON, anything else is kept
// as a string value; blobs keep their uri as an opaque marker.
fn decode_contents(contents: Vec<ResourceContents>) -> serde_json::Value {
    let mut values: Vec<serde_json::Value> = Vec::new();
    for item in contents {
        match item {
            ResourceContents::TextResourceContents { text, .. } => {
                match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(v) => values.push(v),
                    Err(_) => values.push(serde_json::Value::String(text)),
                }
            }
            ResourceContents::BlobResourceContents { uri, .. } => {
                values.push(serde_json::json!({ "blob": uri }));
            }
        }
    }
    match values.len() {
        0 => serde_json::Value::Null,
        1 => values.into_iter().next().unwrap(),
        _ => serde_json::Value::Array(values),
    }
}

#[async_trait]
impl McpClient for RmcpClient {
    fn protocol_version(&self) -> Option<String> {
        self.service
            .peer()
            .peer_info()
            .map(|info| info.protocol_version.to_string())
    }

    fn server_version(&self) -> Option<String> {
        self.service
            .peer()
            .peer_info()
            .map(|info| info.server_info.version.clone())
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, TransportError> {
        let tools = self
            .service
            .list_all_tools()
            .await
            .map_err(map_service_error)?;
        Ok(tools
            .into_iter()
            .map(|t| ToolInfo {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
                input_schema: serde_json::to_value(&t.input_schema).ok(),
            })
            .collect())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceMeta>, TransportError> {
        let resources = self
            .service
            .list_all_resources()
            .await
            .map_err(map_service_error)?;
        Ok(resources
            .into_iter()
            .map(|r| ResourceMeta {
                uri: r.uri.clone(),
                name: r.name.clone(),
                description: r.description.clone(),
                mime_type: r.mime_type.clone(),
            })
            .collect())
    }

    async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, TransportError> {
        let result = self
            .service
            .read_resource(ReadResourceRequestParam { uri: uri.to_string() })
            .await
            .map_err(map_service_error)?;
        Ok(decode_contents(result.contents))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, TransportError> {
        let args = arguments.as_object().cloned();
        let result = self
            .service
            .call_tool(CallToolRequestParam { name: name.to_string().into(), arguments: args })
            .await
            .map_err(map_service_error)?;
        let is_error = result.is_error == Some(true);
        let payload = if let Some(structured) = result.structured_content {
            structured
        } else {
            let text = result
                .content
                .iter()
                .find_map(|c| c.as_text().map(|t| t.text.clone()))
                .unwrap_or_default();
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };
        Ok(ToolOutput { payload, is_error })
    }

    async fn close(&self) {
        self.service.cancellation_token().cancel();
    }
}

/// Default connector used in production wiring.
#[derive(Clone, Default)]
pub struct RmcpConnector;

#[async_trait]
impl ClientConnector for RmcpConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn McpClient>, TransportError> {
        tracing::info!(target = "client", server = %descriptor.id, transport = ?descriptor.transport, "connecting");
        let client = RmcpClient::connect(descriptor).await?;
        Ok(Arc::new(client))
    }
}

/// Run `op` up to three times, backing off exponentially on retryable
/// transport failures. Non-retryable failures return immediately.
pub async fn with_transport_retries<T, F, Fut>(
    defaults: &Defaults,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TransportError>>,
{
    let mut delay = defaults.retry_delay();
    let mut last = None;
    for attempt in 1..=TRANSPORT_MAX_TRIES {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.retryable && attempt < TRANSPORT_MAX_TRIES => {
                tracing::warn!(target = "client", attempt, error = %e, "retrying transport call");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BACKOFF_CAP);
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| TransportError::protocol("retry loop exhausted")))
}
