//! Freshness fingerprints for session logs and registered item code
//!
//! Session hashes are metadata tokens (mtime + size), not content digests:
//! session logs are append-only, so an equal (mtime, size) pair is accepted
//! as equal content. A same-second, same-length overwrite is invisible to
//! this scheme; that approximation is deliberate and must not be replaced
//! with full-content hashing.

use crate::memo::MemoCache;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

/// Freshness token for a session log file
///
/// Empty means "uncacheable": the file could not be statted, so nothing
/// derived from it may be cached or trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// The uncacheable sentinel
    pub const EMPTY: Self = Self(String::new());

    /// Build a token from raw parts (mainly for tests and stored metadata)
    #[must_use]
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the uncacheable sentinel
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fingerprint of a registered item's source
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemCodeHash(String);

impl ItemCodeHash {
    /// Sentinel for "no code hash" (e.g., no helper module configured)
    pub const EMPTY: Self = Self(String::new());

    /// Hash source text into a code hash
    #[must_use]
    pub fn from_source(source: &str) -> Self {
        Self(hex::encode(Sha256::digest(source.as_bytes())))
    }

    /// Build from an already-computed digest string
    #[must_use]
    pub fn from_digest(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    /// The digest text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the empty sentinel
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ItemCodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long repeated stats of the same path are collapsed into one
const STAT_MEMO_TTL: Duration = Duration::from_secs(5);

/// Computes and memoizes freshness fingerprints
pub struct ContentHasher {
    stat_memo: MemoCache<PathBuf, ContentHash>,
    module_memo: MemoCache<PathBuf, ItemCodeHash>,
    code_memo: Mutex<HashMap<String, (String, ItemCodeHash)>>,
    module_path: Option<PathBuf>,
}

impl ContentHasher {
    /// Create a hasher; `module_path` points at the optional helper module
    /// registered items may import, hashed in full when configured
    #[must_use]
    pub fn new(module_path: Option<PathBuf>) -> Self {
        Self::with_stat_ttl(module_path, STAT_MEMO_TTL)
    }

    /// Create a hasher with an explicit stat-memoization window
    ///
    /// A zero TTL disables the burst collapse; every lookup stats afresh.
    #[must_use]
    pub fn with_stat_ttl(module_path: Option<PathBuf>, stat_ttl: Duration) -> Self {
        Self {
            stat_memo: MemoCache::new(stat_ttl),
            module_memo: MemoCache::new(stat_ttl),
            code_memo: Mutex::new(HashMap::new()),
            module_path,
        }
    }

    /// Freshness token for a session log
    ///
    /// Stats the file and combines mtime-millis with byte size. Stat results
    /// are memoized briefly so a burst of lookups does one syscall. Missing
    /// or unreadable files yield [`ContentHash::EMPTY`].
    pub async fn session_hash(&self, path: &Path) -> ContentHash {
        let owned = path.to_path_buf();
        let computed = self
            .stat_memo
            .get_or_compute(owned.clone(), || stat_token(owned))
            .await;
        match computed {
            Ok(hash) => hash,
            Err(error) => {
                tracing::debug!(path = %path.display(), %error, "stat failed; session uncacheable");
                ContentHash::EMPTY
            }
        }
    }

    /// Freshness token for a subagent log
    ///
    /// Probes the candidate paths in order and hashes the first that exists;
    /// returns [`ContentHash::EMPTY`] when none do.
    pub async fn subagent_hash(&self, candidates: &[PathBuf]) -> ContentHash {
        for candidate in candidates {
            let hash = self.session_hash(candidate).await;
            if !hash.is_empty() {
                return hash;
            }
        }
        ContentHash::EMPTY
    }

    /// Code hash for a registered item, memoized per item identity
    ///
    /// Recomputes only when the item's fingerprint text changes.
    pub fn item_code_hash(&self, name: &str, fingerprint: &str) -> ItemCodeHash {
        let mut memo = self.code_memo.lock();
        if let Some((stored_fingerprint, hash)) = memo.get(name)
            && stored_fingerprint == fingerprint
        {
            return hash.clone();
        }
        let hash = ItemCodeHash::from_source(fingerprint);
        memo.insert(name.to_string(), (fingerprint.to_string(), hash.clone()));
        hash
    }

    /// Full-content hash of the configured helper module
    ///
    /// [`ItemCodeHash::EMPTY`] when unconfigured or unreadable; the module is
    /// expected to be small, so a full read is acceptable.
    pub async fn module_hash(&self) -> ItemCodeHash {
        let Some(path) = self.module_path.clone() else {
            return ItemCodeHash::EMPTY;
        };
        let computed = self
            .module_memo
            .get_or_compute(path.clone(), || read_module_digest(path))
            .await;
        match computed {
            Ok(hash) => hash,
            Err(error) => {
                tracing::debug!(%error, "module hash unavailable");
                ItemCodeHash::EMPTY
            }
        }
    }

    /// Effective code hash for cache validation
    ///
    /// The item's own hash, folded together with the helper-module hash when
    /// one is configured, so editing the shared module invalidates every
    /// item's entries while editing one item touches only its own.
    pub async fn effective_code_hash(&self, name: &str, fingerprint: &str) -> ItemCodeHash {
        let item_hash = self.item_code_hash(name, fingerprint);
        let module_hash = self.module_hash().await;
        if module_hash.is_empty() {
            return item_hash;
        }
        let mut hasher = Sha256::new();
        hasher.update(item_hash.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(module_hash.as_str().as_bytes());
        ItemCodeHash::from_digest(hex::encode(hasher.finalize()))
    }
}

async fn stat_token(path: PathBuf) -> Result<ContentHash> {
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|e| Error::io(e, &path, "stat"))?;
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis());
    Ok(ContentHash::from_token(format!(
        "{mtime_ms}-{}",
        metadata.len()
    )))
}

async fn read_module_digest(path: PathBuf) -> Result<ItemCodeHash> {
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| Error::io(e, &path, "read"))?;
    Ok(ItemCodeHash::from_digest(hex::encode(Sha256::digest(
        &bytes,
    ))))
}
