//! Priority-ordered merge of per-server resource snapshots, with the
//! deterministic projections the prompt and the schema checks feed on.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::resources::{ResourceEntry, ResourceSnapshot};

#[derive(Debug, Clone)]
pub struct CatalogServer {
    pub id: String,
    pub display_name: String,
    pub priority: u16,
    pub domains: Vec<String>,
    pub capabilities: Vec<String>,
    pub snapshot: Arc<ResourceSnapshot>,
}

impl CatalogServer {
    fn has_domain(&self, needle: &str) -> bool {
        self.domains.iter().any(|d| d.to_lowercase().contains(needle))
    }
}

/// A table surfaced by a database-domain server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub source_server: String,
}

impl TableSchema {
    pub fn has_column(&self, name: &str) -> bool {
        let needle = name.to_lowercase();
        self.columns.iter().any(|c| c.to_lowercase() == needle)
    }
}

/// Merged view across all ready servers, ordered by priority (then id, for
/// a stable tie-break). Raw entries stay retrievable per server; only the
/// convenience projections apply priority dedup.
#[derive(Debug, Clone, Default)]
pub struct AggregatedCatalog {
    servers: Vec<CatalogServer>,
}

impl AggregatedCatalog {
    pub fn new(mut servers: Vec<CatalogServer>) -> Self {
        servers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Self { servers }
    }

    pub fn servers(&self) -> &[CatalogServer] {
        &self.servers
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.iter().all(|s| s.snapshot.is_empty())
    }

    /// Raw entry lookup under its identity `(server_id, uri)`.
    pub fn entry(&self, server_id: &str, uri: &str) -> Option<&ResourceEntry> {
        self.servers
            .iter()
            .find(|s| s.id == server_id)
            .and_then(|s| s.snapshot.get(uri))
    }

    /// Merged uri view: when two servers expose the same uri, the one with
    /// the lower priority number wins.
    pub fn merged_entries(&self) -> BTreeMap<&str, &ResourceEntry> {
        let mut out: BTreeMap<&str, &ResourceEntry> = BTreeMap::new();
        for server in &self.servers {
            for (uri, entry) in &server.snapshot.entries {
                out.entry(uri.as_str()).or_insert(entry);
            }
        }
        out
    }

    /// Digest over the per-server snapshot hashes, stable across re-fetches
    /// of unchanged content. Suitable for keying downstream caches.
    pub fn combined_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for server in &self.servers {
            hasher.update(server.id.as_bytes());
            hasher.update([0u8]);
            hasher.update(server.snapshot.metadata_hash.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Known product names: entries from product/metadata-domain servers
    /// plus any entry whose uri mentions products or aliases. Deduplicated
    /// case-insensitively, keeping the casing of the highest-precedence
    /// server.
    pub fn product_names(&self) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for server in &self.servers {
            let domain_applies = server.has_domain("product") || server.has_domain("metadata");
            for (uri, entry) in &server.snapshot.entries {
                let uri_lower = uri.to_lowercase();
                if !(domain_applies || uri_lower.contains("product") || uri_lower.contains("alias"))
                {
                    continue;
                }
                collect_named(&entry.payload, &mut |name| {
                    if seen.insert(name.to_lowercase()) {
                        out.push(name.to_string());
                    }
                });
            }
        }
        out
    }

    /// Known tables and their columns, from database-domain servers and
    /// schema/table-flavored resources.
    pub fn tables(&self) -> Vec<TableSchema> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for server in &self.servers {
            let domain_applies = server.has_domain("database");
            for (uri, entry) in &server.snapshot.entries {
                let uri_lower = uri.to_lowercase();
                if !(domain_applies || uri_lower.contains("schema") || uri_lower.contains("table"))
                {
                    continue;
                }
                collect_tables(&entry.payload, &server.id, &mut |table| {
                    if seen.insert(table.name.to_lowercase()) {
                        out.push(table);
                    }
                });
            }
        }
        out
    }

    pub fn table(&self, name: &str) -> Option<TableSchema> {
        let needle = name.to_lowercase();
        self.tables().into_iter().find(|t| t.name.to_lowercase() == needle)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }
}

// Walk a payload for arrays of objects carrying a string `name` field.
fn collect_named(value: &serde_json::Value, sink: &mut impl FnMut(&str)) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                if let serde_json::Value::Object(map) = item
                    && let Some(serde_json::Value::String(name)) = map.get("name")
                {
                    sink(name);
                }
                collect_named(item, sink);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map {
                collect_named(v, sink);
            }
        }
        _ => {}
    }
}

// Walk a payload for objects shaped like a table: a string `name` next to a
// `columns` array whose elements are strings or `{name}` objects.
fn collect_tables(
    value: &serde_json::Value,
    source_server: &str,
    sink: &mut impl FnMut(TableSchema),
) {
    match value {
        serde_json::Value::Object(map) => {
            if let (Some(serde_json::Value::String(name)), Some(serde_json::Value::Array(cols))) =
                (map.get("name"), map.get("columns"))
            {
                let columns: Vec<String> = cols
                    .iter()
                    .filter_map(|c| match c {
                        serde_json::Value::String(s) => Some(s.clone()),
                        serde_json::Value::Object(m) => match m.get("name") {
                            Some(serde_json::Value::String(s)) => Some(s.clone()),
                            _ => None,
                        },
                        _ => None,
                    })
                    .collect();
                sink(TableSchema {
                    name: name.clone(),
                    columns,
                    source_server: source_server.to_string(),
                });
            }
            for (_, v) in map {
                collect_tables(v, source_server, sink);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_tables(item, source_server, sink);
            }
        }
        _ => {}
    }
}
