//! Session registry: lifecycle and health of the subordinate MCP servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientConnector, McpClient};
use crate::config::ServerDescriptor;
use crate::error::{Error, Result};
use crate::types::{ServerStatusView, ToolInfo};

pub const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        }
    }
}

/// One live MCP conversation. Shared read-only across request tasks; state
/// transitions go through the registry which serializes them per session.
pub struct Session {
    descriptor: ServerDescriptor,
    client: RwLock<Option<Arc<dyn McpClient>>>,
    state: RwLock<SessionState>,
    requests: AtomicU64,
    errors: AtomicU64,
    consecutive_failures: AtomicU32,
    last_success: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    tools: RwLock<Vec<ToolInfo>>,
}

impl Session {
    fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            client: RwLock::new(None),
            state: RwLock::new(SessionState::Connecting),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_success: RwLock::new(None),
            last_error: RwLock::new(None),
            protocol_version: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await == SessionState::Ready
    }

    pub async fn client(&self) -> Option<Arc<dyn McpClient>> {
        self.client.read().await.clone()
    }

    pub async fn tools(&self) -> Vec<ToolInfo> {
        self.tools.read().await.clone()
    }

    pub async fn protocol_version(&self) -> Option<String> {
        self.protocol_version.read().await.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Holds session handles and routes health updates. Read-mostly: request
/// tasks only read; transitions funnel through the mark/connect paths.
pub struct ServerRegistry {
    sessions: Vec<Arc<Session>>,
    by_id: HashMap<String, Arc<Session>>,
    connector: Arc<dyn ClientConnector>,
    shutdown: CancellationToken,
    shut_down: AtomicBool,
    reconnect_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl ServerRegistry {
    /// Build sessions for every enabled descriptor, ordered by priority then
    /// id so that iteration order is stable.
    pub fn new(descriptors: Vec<ServerDescriptor>, connector: Arc<dyn ClientConnector>) -> Self {
        let mut enabled: Vec<ServerDescriptor> =
            descriptors.into_iter().filter(|d| d.enabled).collect();
        enabled.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        let sessions: Vec<Arc<Session>> =
            enabled.into_iter().map(|d| Arc::new(Session::new(d))).collect();
        let by_id = sessions
            .iter()
            .map(|s| (s.id().to_string(), s.clone()))
            .collect();
        Self {
            sessions,
            by_id,
            connector,
            shutdown: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            reconnect_task: RwLock::new(None),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Initialize all sessions concurrently. A critical descriptor that
    /// fails aborts startup; non-critical failures leave the session
    /// degraded for the reconnect loop to pick up.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let results = join_all(self.sessions.iter().map(|session| {
            let session = session.clone();
            let connector = self.connector.clone();
            async move {
                let outcome = Self::establish(&connector, &session).await;
                (session, outcome)
            }
        }))
        .await;

        for (session, outcome) in results {
            if let Err(e) = outcome {
                if session.descriptor().critical {
                    return Err(Error::Initialization {
                        server: session.id().to_string(),
                        reason: e.to_string(),
                    });
                }
                tracing::warn!(target = "registry", server = %session.id(), error = %e, "non-critical server degraded at startup");
            }
        }

        let registry = self.clone();
        let handle = tokio::spawn(async move { registry.reconnect_loop().await });
        *self.reconnect_task.write().await = Some(handle);
        Ok(())
    }

    // Connect one session and probe its surface; ready on success.
    async fn establish(
        connector: &Arc<dyn ClientConnector>,
        session: &Arc<Session>,
    ) -> std::result::Result<(), crate::error::TransportError> {
        *session.state.write().await = SessionState::Connecting;
        let connect = async {
            let client = connector.connect(session.descriptor()).await?;
            let tools = client.list_tools().await?;
            let _ = client.list_resources().await?;
            Ok::<_, crate::error::TransportError>((client, tools))
        };
        match connect.await {
            Ok((client, tools)) => {
                *session.protocol_version.write().await = client.protocol_version();
                *session.tools.write().await = tools;
                *session.client.write().await = Some(client);
                *session.last_error.write().await = None;
                session.consecutive_failures.store(0, Ordering::SeqCst);
                *session.state.write().await = SessionState::Ready;
                tracing::info!(target = "registry", server = %session.id(), "session ready");
                Ok(())
            }
            Err(e) => {
                *session.last_error.write().await = Some(e.to_string());
                *session.state.write().await = SessionState::Degraded;
                Err(e)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.by_id.get(id).cloned()
    }

    /// Session by id, only when ready.
    pub async fn ready(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.get(id)?;
        if session.is_ready().await { Some(session) } else { None }
    }

    /// All ready sessions, in priority order.
    pub async fn ready_sessions(&self) -> Vec<Arc<Session>> {
        let mut out = Vec::new();
        for session in &self.sessions {
            if session.is_ready().await {
                out.push(session.clone());
            }
        }
        out
    }

    /// The ready server with the execute_query capability and the lowest
    /// priority number.
    pub async fn executor(&self) -> Option<Arc<Session>> {
        for session in &self.sessions {
            if session.descriptor().has_capability("execute_query") && session.is_ready().await {
                return Some(session.clone());
            }
        }
        None
    }

    pub async fn mark_success(&self, id: &str) {
        if let Some(session) = self.get(id) {
            session.requests.fetch_add(1, Ordering::Relaxed);
            session.consecutive_failures.store(0, Ordering::SeqCst);
            *session.last_success.write().await = Some(Utc::now());
        }
    }

    /// Count a failure against a session; three in a row degrade it and
    /// drop its client.
    pub async fn mark_failure(&self, id: &str, error: &str) {
        let Some(session) = self.get(id) else { return };
        session.requests.fetch_add(1, Ordering::Relaxed);
        session.errors.fetch_add(1, Ordering::Relaxed);
        *session.last_error.write().await = Some(error.to_string());
        let failures = session.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= CONSECUTIVE_FAILURE_LIMIT {
            let mut state = session.state.write().await;
            if *state == SessionState::Ready {
                *state = SessionState::Degraded;
                drop(state);
                if let Some(client) = session.client.write().await.take() {
                    client.close().await;
                }
                tracing::warn!(target = "registry", server = %id, failures, "session degraded");
            }
        }
    }

    pub async fn status(&self) -> Vec<ServerStatusView> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for session in &self.sessions {
            out.push(ServerStatusView {
                id: session.id().to_string(),
                display_name: session.descriptor().name.clone(),
                state: session.state().await.as_str().to_string(),
                priority: session.descriptor().priority,
                tools: session.tools.read().await.len() as u32,
                last_error: session.last_error().await,
            });
        }
        out
    }

    /// Close everything. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        if let Some(handle) = self.reconnect_task.write().await.take() {
            handle.abort();
        }
        for session in &self.sessions {
            if let Some(client) = session.client.write().await.take() {
                client.close().await;
            }
            *session.state.write().await = SessionState::Closed;
        }
        tracing::info!(target = "registry", "registry shut down");
    }

    // Periodically retry degraded sessions with per-session exponential
    // backoff, until the shutdown token fires.
    async fn reconnect_loop(self: Arc<Self>) {
        let mut backoff: HashMap<String, (Duration, tokio::time::Instant)> = HashMap::new();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            for session in &self.sessions {
                if session.state().await != SessionState::Degraded {
                    backoff.remove(session.id());
                    continue;
                }
                let now = tokio::time::Instant::now();
                let entry = backoff
                    .entry(session.id().to_string())
                    .or_insert((RECONNECT_BASE, now));
                if now < entry.1 {
                    continue;
                }
                tracing::debug!(target = "registry", server = %session.id(), "reconnect attempt");
                match Self::establish(&self.connector, session).await {
                    Ok(()) => {
                        backoff.remove(session.id());
                    }
                    Err(e) => {
                        let delay = entry.0;
                        *entry = ((delay * 2).min(RECONNECT_CAP), now + delay);
                        tracing::debug!(target = "registry", server = %session.id(), error = %e, next_in = ?delay, "reconnect failed");
                    }
                }
            }
        }
    }
}
