//! Two-tier content-addressed result store
//!
//! Whole-result entries span every registered item for a session; per-item
//! entries cover one item so that editing a single function invalidates only
//! its own cache. Entries carry the hashes they were computed against and
//! are accepted only when those hashes still match; staleness is detected
//! at read time, never swept.
//!
//! Every failure on this path degrades to a miss or a no-op: caching must
//! never cause a computation to fail or return wrong data.

use crate::backend::{BackendStats, KvBackend, StoreKey, StorePrefix};
use crate::hash::{ContentHash, ItemCodeHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Metadata stored beside a whole-result value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsMeta {
    /// When the entry was written
    pub cached_at: DateTime<Utc>,
    /// Session content hash the results were computed against
    pub content_hash: String,
}

/// Persisted whole-result document: every item's value for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResults {
    /// Item values keyed by item name
    pub value: BTreeMap<String, Value>,
    /// Validation metadata
    pub meta: ResultsMeta,
}

/// Metadata stored beside a single item's value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMeta {
    /// When the entry was written
    pub cached_at: DateTime<Utc>,
    /// Session content hash the value was computed against
    pub content_hash: String,
    /// Code hash of the item that produced the value
    pub item_code_hash: String,
}

/// Persisted per-item document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredItem {
    /// The item's computed value
    pub value: Value,
    /// Validation metadata
    pub meta: ItemMeta,
}

/// Content-addressed cache store over a pluggable backend
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn KvBackend>,
}

impl CacheStore {
    /// Create a store over the given backend
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Read a whole-result entry, accepted only on a content-hash match
    ///
    /// Uncacheable sessions (empty hash) and every backend or decode failure
    /// read as a miss.
    pub async fn get_results(
        &self,
        namespace: &str,
        project: &str,
        session_key: &str,
        item_names: &[String],
        content_hash: &ContentHash,
    ) -> Option<BTreeMap<String, Value>> {
        if content_hash.is_empty() {
            return None;
        }
        let key = results_key(namespace, project, session_key, item_names);
        let stored: StoredResults = self.read_doc(&key).await?;
        if stored.meta.content_hash == content_hash.as_str() {
            Some(stored.value)
        } else {
            None
        }
    }

    /// Write a whole-result entry, best effort
    ///
    /// Failures are logged and swallowed; uncacheable sessions are skipped.
    pub async fn set_results(
        &self,
        namespace: &str,
        project: &str,
        session_key: &str,
        item_names: &[String],
        content_hash: &ContentHash,
        value: BTreeMap<String, Value>,
    ) {
        if content_hash.is_empty() {
            return;
        }
        let key = results_key(namespace, project, session_key, item_names);
        let doc = StoredResults {
            value,
            meta: ResultsMeta {
                cached_at: Utc::now(),
                content_hash: content_hash.as_str().to_string(),
            },
        };
        self.write_doc(&key, &doc).await;
    }

    /// Read a per-item entry, accepted only when BOTH stored hashes match
    pub async fn get_item(
        &self,
        namespace: &str,
        project: &str,
        session_key: &str,
        item_name: &str,
        content_hash: &ContentHash,
        item_code_hash: &ItemCodeHash,
    ) -> Option<Value> {
        if content_hash.is_empty() {
            return None;
        }
        let key = StoreKey::new(namespace, project, session_key, item_name);
        let stored: StoredItem = self.read_doc(&key).await?;
        let fresh = stored.meta.content_hash == content_hash.as_str()
            && stored.meta.item_code_hash == item_code_hash.as_str();
        fresh.then_some(stored.value)
    }

    /// Write a per-item entry, best effort
    pub async fn set_item(
        &self,
        namespace: &str,
        project: &str,
        session_key: &str,
        item_name: &str,
        content_hash: &ContentHash,
        item_code_hash: &ItemCodeHash,
        value: Value,
    ) {
        if content_hash.is_empty() {
            return;
        }
        let key = StoreKey::new(namespace, project, session_key, item_name);
        let doc = StoredItem {
            value,
            meta: ItemMeta {
                cached_at: Utc::now(),
                content_hash: content_hash.as_str().to_string(),
                item_code_hash: item_code_hash.as_str().to_string(),
            },
        };
        self.write_doc(&key, &doc).await;
    }

    /// Drop everything under a project, or one session of it
    ///
    /// Returns the number of removed entries; failures count as zero.
    pub async fn invalidate(
        &self,
        namespace: &str,
        project: &str,
        session_key: Option<&str>,
    ) -> usize {
        let prefix = match session_key {
            Some(session_key) => StorePrefix::session(namespace, project, session_key),
            None => StorePrefix::project(namespace, project),
        };
        match self.backend.remove_prefix(&prefix).await {
            Ok(removed) => removed,
            Err(error) => {
                tracing::warn!(%error, namespace, project, "cache invalidation failed");
                0
            }
        }
    }

    /// Entry count and byte total for a namespace
    pub async fn stats(&self, namespace: &str) -> BackendStats {
        match self
            .backend
            .stats(&StorePrefix::namespace(namespace))
            .await
        {
            Ok(stats) => stats,
            Err(error) => {
                tracing::warn!(%error, namespace, "cache stats unavailable");
                BackendStats::default()
            }
        }
    }

    async fn read_doc<T: for<'de> Deserialize<'de>>(&self, key: &StoreKey) -> Option<T> {
        let bytes = match self.backend.read(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(error) => {
                tracing::debug!(%error, key = %key.canonical(), "cache read failed; treating as miss");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(doc) => Some(doc),
            Err(error) => {
                tracing::debug!(%error, key = %key.canonical(), "cache entry corrupt; treating as miss");
                None
            }
        }
    }

    async fn write_doc<T: Serialize>(&self, key: &StoreKey, doc: &T) {
        let bytes = match serde_json::to_vec(doc) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(%error, key = %key.canonical(), "cache entry unserializable; skipping write");
                return;
            }
        };
        if let Err(error) = self.backend.write(key, &bytes).await {
            tracing::warn!(%error, key = %key.canonical(), "cache write failed; result not persisted");
        }
    }
}

/// Whole-result leaf: the sorted item names joined into one token
fn results_key(
    namespace: &str,
    project: &str,
    session_key: &str,
    item_names: &[String],
) -> StoreKey {
    let mut names: Vec<&str> = item_names.iter().map(String::as_str).collect();
    names.sort_unstable();
    StoreKey::new(namespace, project, session_key, names.join("+"))
}
