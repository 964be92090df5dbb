use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::graph::{ArtifactId, NodeId, NodeKind};

/// Hex characters kept from the SHA-256 digest.
const ID_HEX_LEN: usize = 32;

/// Reference to an entity by its upstream identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExternalRef {
    pub source_system: String,
    pub external_key: String,
}

impl ExternalRef {
    #[must_use]
    pub fn new(source_system: &str, external_key: &str) -> Self {
        Self { source_system: source_system.to_string(), external_key: external_key.to_string() }
    }
}

/// Default external key for records that only carry a kind and a name.
#[must_use]
pub fn default_external_key(kind: NodeKind, name: &str) -> String {
    format!("{}:{}", kind.as_str(), name.trim())
}

fn normalize_source(source_system: &str) -> String {
    source_system.trim().to_ascii_lowercase()
}

fn digest(namespace: &str, source_system: &str, external_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_source(source_system).as_bytes());
    hasher.update([0u8]);
    hasher.update(external_key.trim().as_bytes());
    let out = hasher.finalize();
    let mut hex: String = out.iter().map(|b| format!("{b:02x}")).collect();
    hex.truncate(ID_HEX_LEN);
    hex
}

/// Stable node id for `(source_system, external_key)`.
///
/// The source system is case-insensitive and both parts are trimmed, so records that differ only
/// in surrounding whitespace or source casing land on the same node.
#[must_use]
pub fn node_id_for(source_system: &str, external_key: &str) -> NodeId {
    NodeId(digest("node", source_system, external_key))
}

#[must_use]
pub fn artifact_id_for(source_system: &str, external_key: &str) -> ArtifactId {
    ArtifactId(digest("doc", source_system, external_key))
}

/// Memoizing resolver used by the builder for the lifetime of a scope.
#[derive(Debug, Default, Clone)]
pub struct IdentityResolver {
    // (source, key) -> id; strings interned so repeated keys share storage
    cache: HashMap<(Arc<str>, Arc<str>), NodeId>,
    pool: HashSet<Arc<str>>,
    hits: u64,
}

impl IdentityResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(k) = self.pool.get(s) {
            return k.clone();
        }
        let a: Arc<str> = Arc::from(s);
        self.pool.insert(a.clone());
        a
    }

    pub fn resolve(&mut self, r: &ExternalRef) -> NodeId {
        let source = self.intern(&normalize_source(&r.source_system));
        let key = self.intern(r.external_key.trim());
        if let Some(id) = self.cache.get(&(source.clone(), key.clone())) {
            self.hits += 1;
            return id.clone();
        }
        let id = node_id_for(&source, &key);
        self.cache.insert((source, key), id.clone());
        id
    }

    /// Resolve `r` and drop its memo entry, releasing interned strings nothing else uses.
    pub fn forget(&mut self, r: &ExternalRef) -> NodeId {
        let source = normalize_source(&r.source_system);
        let key = r.external_key.trim();
        let (Some(s), Some(k)) = (self.pool.get(source.as_str()).cloned(), self.pool.get(key).cloned()) else {
            return node_id_for(&source, key);
        };
        let entry = (s, k);
        let Some(id) = self.cache.remove(&entry) else {
            return node_id_for(&source, key);
        };
        let (s, k) = entry;
        for interned in [s, k] {
            // One count for the pool, one for this local
            if Arc::strong_count(&interned) <= 2 {
                self.pool.remove(&interned);
            }
        }
        id
    }

    /// Number of lookups answered from the cache.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
