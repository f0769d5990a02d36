//! Per-server resource snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::client::with_transport_retries;
use crate::config::Defaults;
use crate::error::TransportError;
use crate::registry::Session;

/// One resource read from a server. Identity is `(server_id, uri)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub server_id: String,
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub payload: serde_json::Value,
}

/// Immutable read of one server's resources. Replaced wholesale by the
/// cache, never mutated in place.
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub server_id: String,
    pub entries: BTreeMap<String, ResourceEntry>,
    pub fetched_at: tokio::time::Instant,
    pub fetched_at_utc: DateTime<Utc>,
    pub fetch_duration: Duration,
    pub metadata_hash: String,
}

impl ResourceSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, uri: &str) -> Option<&ResourceEntry> {
        self.entries.get(uri)
    }
}

/// Digest over `(uri, payload)` pairs in key order. serde_json maps are
/// key-sorted, so equal payloads hash equally across fetches.
pub fn metadata_hash(entries: &BTreeMap<String, ResourceEntry>) -> String {
    let mut hasher = Sha256::new();
    for (uri, entry) in entries {
        hasher.update(uri.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.payload.to_string().as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// List and read every resource of a ready session into a fresh snapshot.
///
/// Individual reads that keep failing after retries are skipped with a
/// warning so that one broken resource does not hide the rest; the listing
/// call itself failing fails the snapshot.
pub async fn fetch_snapshot(
    session: &Arc<Session>,
    defaults: &Defaults,
) -> Result<ResourceSnapshot, TransportError> {
    let started = tokio::time::Instant::now();
    let client = session
        .client()
        .await
        .ok_or_else(|| TransportError::closed("session has no client"))?;

    let listing = with_transport_retries(defaults, || {
        let client = client.clone();
        async move { client.list_resources().await }
    })
    .await?;

    let reads = join_all(listing.into_iter().map(|meta| {
        let client = client.clone();
        let defaults = defaults.clone();
        async move {
            let result = with_transport_retries(&defaults, || {
                let client = client.clone();
                let uri = meta.uri.clone();
                async move { client.read_resource(&uri).await }
            })
            .await;
            (meta, result)
        }
    }))
    .await;

    let mut entries = BTreeMap::new();
    for (meta, result) in reads {
        match result {
            Ok(payload) => {
                entries.insert(
                    meta.uri.clone(),
                    ResourceEntry {
                        server_id: session.id().to_string(),
                        uri: meta.uri,
                        name: meta.name,
                        mime_type: meta.mime_type,
                        description: meta.description,
                        payload,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(target = "cache", server = %session.id(), uri = %meta.uri, error = %e, "skipping unreadable resource");
            }
        }
    }

    let hash = metadata_hash(&entries);
    Ok(ResourceSnapshot {
        server_id: session.id().to_string(),
        entries,
        fetched_at: started,
        fetched_at_utc: Utc::now(),
        fetch_duration: started.elapsed(),
        metadata_hash: hash,
    })
}
