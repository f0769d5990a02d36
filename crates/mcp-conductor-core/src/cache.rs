//! TTL-bounded, per-server resource cache behind the aggregated catalog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::catalog::{AggregatedCatalog, CatalogServer};
use crate::config::Defaults;
use crate::registry::{ServerRegistry, Session};
use crate::resources::{ResourceSnapshot, fetch_snapshot};

pub struct ResourceCache {
    registry: Arc<ServerRegistry>,
    defaults: Defaults,
    ttl: Duration,
    refresh_interval: Duration,
    slots: RwLock<HashMap<String, Arc<ResourceSnapshot>>>,
    // Per-server guards so concurrent catalog calls fetch at most once.
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    refresher: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl ResourceCache {
    pub fn new(
        registry: Arc<ServerRegistry>,
        defaults: Defaults,
        ttl: Duration,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            registry,
            defaults,
            ttl,
            refresh_interval,
            slots: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            refresher: RwLock::new(None),
        }
    }

    fn is_fresh(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.fetched_at.elapsed() < self.ttl
    }

    async fn flight_guard(&self, id: &str) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights.entry(id.to_string()).or_default().clone()
    }

    // Current snapshot for one session, refreshing through the single-flight
    // guard when missing or expired. A failed refresh falls back to the
    // stale snapshot when one exists.
    async fn snapshot_for(
        &self,
        session: &Arc<Session>,
        force: bool,
    ) -> Option<Arc<ResourceSnapshot>> {
        if !force
            && let Some(snapshot) = self.slots.read().await.get(session.id())
            && self.is_fresh(snapshot)
        {
            return Some(snapshot.clone());
        }
        let guard = self.flight_guard(session.id()).await;
        let _held = guard.lock().await;
        // Someone else may have refreshed while we waited on the guard.
        if !force
            && let Some(snapshot) = self.slots.read().await.get(session.id())
            && self.is_fresh(snapshot)
        {
            return Some(snapshot.clone());
        }
        match fetch_snapshot(session, &self.defaults).await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.slots
                    .write()
                    .await
                    .insert(session.id().to_string(), snapshot.clone());
                self.registry.mark_success(session.id()).await;
                tracing::debug!(target = "cache", server = %session.id(), entries = snapshot.entries.len(), hash = %snapshot.metadata_hash, "snapshot refreshed");
                Some(snapshot)
            }
            Err(e) => {
                self.registry.mark_failure(session.id(), &e.to_string()).await;
                let stale = self.slots.read().await.get(session.id()).cloned();
                if stale.is_some() {
                    tracing::warn!(target = "cache", server = %session.id(), error = %e, "refresh failed, serving stale snapshot");
                } else {
                    tracing::warn!(target = "cache", server = %session.id(), error = %e, "refresh failed, no snapshot available");
                }
                stale
            }
        }
    }

    /// The merged catalog over every ready session. Only blocks on the
    /// network for servers whose snapshot is missing or expired.
    pub async fn catalog(&self) -> AggregatedCatalog {
        self.assemble(false).await
    }

    /// Force a parallel refetch of every ready server.
    pub async fn refresh(&self) -> AggregatedCatalog {
        self.assemble(true).await
    }

    async fn assemble(&self, force: bool) -> AggregatedCatalog {
        let sessions = self.registry.ready_sessions().await;
        let fetched = join_all(sessions.into_iter().map(|session| async move {
            let snapshot = self.snapshot_for(&session, force).await?;
            Some(CatalogServer {
                id: session.id().to_string(),
                display_name: session.descriptor().name.clone(),
                priority: session.descriptor().priority,
                domains: session.descriptor().domains.clone(),
                capabilities: session.descriptor().capabilities.clone(),
                snapshot,
            })
        }))
        .await;
        AggregatedCatalog::new(fetched.into_iter().flatten().collect())
    }

    /// Discard one server's snapshot; the next access refetches.
    pub async fn invalidate(&self, server_id: &str) {
        self.slots.write().await.remove(server_id);
        tracing::debug!(target = "cache", server = %server_id, "snapshot invalidated");
    }

    /// Start the periodic background refresh. A cancelled pass leaves the
    /// previous snapshots in place; swaps only happen on completed fetches.
    pub async fn spawn_refresher(self: &Arc<Self>, token: CancellationToken) {
        let cache = self.clone();
        let interval = self.refresh_interval;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, first use primes
            // the cache anyway.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = cache.refresh() => {}
                }
            }
        });
        *self.refresher.write().await = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.refresher.write().await.take() {
            handle.abort();
        }
    }
}
