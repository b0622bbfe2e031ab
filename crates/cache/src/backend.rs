//! Pluggable key-value backends for the cache store
//!
//! The default backend keeps one JSON file per key on local disk. Alternate
//! backends only need to implement [`KvBackend`]; nothing above this module
//! touches the filesystem directly.

use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Fully qualified cache key: `{namespace}/{project}/{session_key}/{leaf}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey {
    /// Top-level namespace (e.g., "items", "views")
    pub namespace: String,
    /// Project the entry belongs to
    pub project: String,
    /// Session key (session id, possibly suffixed for subagents)
    pub session_key: String,
    /// Leaf name: an item name or a joined sorted item-name list
    pub leaf: String,
}

impl StoreKey {
    /// Build a key from its four components
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        project: impl Into<String>,
        session_key: impl Into<String>,
        leaf: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            project: project.into(),
            session_key: session_key.into(),
            leaf: leaf.into(),
        }
    }

    /// Canonical string form, used by non-hierarchical backends
    #[must_use]
    pub fn canonical(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.namespace, self.project, self.session_key, self.leaf
        )
    }
}

/// Key prefix for bulk operations; narrower fields require the wider ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePrefix {
    /// Namespace to operate on
    pub namespace: String,
    /// Restrict to one project
    pub project: Option<String>,
    /// Restrict to one session within the project
    pub session_key: Option<String>,
}

impl StorePrefix {
    /// Whole-namespace prefix
    #[must_use]
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            project: None,
            session_key: None,
        }
    }

    /// Project-wide prefix
    #[must_use]
    pub fn project(namespace: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            project: Some(project.into()),
            session_key: None,
        }
    }

    /// Single-session prefix
    #[must_use]
    pub fn session(
        namespace: impl Into<String>,
        project: impl Into<String>,
        session_key: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            project: Some(project.into()),
            session_key: Some(session_key.into()),
        }
    }

    fn matches(&self, key: &StoreKey) -> bool {
        key.namespace == self.namespace
            && self.project.as_ref().is_none_or(|p| *p == key.project)
            && self
                .session_key
                .as_ref()
                .is_none_or(|s| *s == key.session_key)
    }
}

/// Aggregate size of a key range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Number of stored entries
    pub entries: usize,
    /// Total stored bytes
    pub bytes: u64,
}

/// Persisted key-value backend for cached results
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read the bytes stored under a key, `None` when absent
    async fn read(&self, key: &StoreKey) -> Result<Option<Vec<u8>>>;

    /// Store bytes under a key, overwriting any previous value
    async fn write(&self, key: &StoreKey, bytes: &[u8]) -> Result<()>;

    /// Remove every key under the prefix, returning how many were removed
    async fn remove_prefix(&self, prefix: &StorePrefix) -> Result<usize>;

    /// Entry count and byte total under the prefix
    async fn stats(&self, prefix: &StorePrefix) -> Result<BackendStats>;
}

/// Replace path-hostile characters in one key component
fn sanitize_component(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    if cleaned.starts_with('.') {
        format!("_{}", cleaned.trim_start_matches('.'))
    } else {
        cleaned
    }
}

/// One-file-per-key backend on local disk
///
/// Layout: `{root}/{namespace}/{project}/{session_key}/{leaf}.json`.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Create a backend rooted at the given directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The backend's root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &StoreKey) -> PathBuf {
        self.root
            .join(sanitize_component(&key.namespace))
            .join(sanitize_component(&key.project))
            .join(sanitize_component(&key.session_key))
            .join(format!("{}.json", sanitize_component(&key.leaf)))
    }

    fn prefix_path(&self, prefix: &StorePrefix) -> PathBuf {
        let mut path = self.root.join(sanitize_component(&prefix.namespace));
        if let Some(project) = &prefix.project {
            path = path.join(sanitize_component(project));
            if let Some(session_key) = &prefix.session_key {
                path = path.join(sanitize_component(session_key));
            }
        }
        path
    }
}

#[async_trait]
impl KvBackend for FsBackend {
    async fn read(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &path, "read")),
        }
    }

    async fn write(&self, key: &StoreKey, bytes: &[u8]) -> Result<()> {
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::io(e, &path, "write"))
    }

    async fn remove_prefix(&self, prefix: &StorePrefix) -> Result<usize> {
        let path = self.prefix_path(prefix);
        let stats = walk_stats(&path).await?;
        if stats.entries == 0 {
            return Ok(0);
        }
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|e| Error::io(e, &path, "remove_dir_all"))?;
        Ok(stats.entries)
    }

    async fn stats(&self, prefix: &StorePrefix) -> Result<BackendStats> {
        walk_stats(&self.prefix_path(prefix)).await
    }
}

/// Count files and bytes beneath a directory; absent directories are empty
async fn walk_stats(root: &Path) -> Result<BackendStats> {
    let mut stats = BackendStats::default();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::io(e, &dir, "read_dir")),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(e, &dir, "read_dir"))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| Error::io(e, entry.path(), "stat"))?;
            if metadata.is_dir() {
                pending.push(entry.path());
            } else {
                stats.entries += 1;
                stats.bytes += metadata.len();
            }
        }
    }
    Ok(stats)
}

/// In-memory backend, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<StoreKey, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn read(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn write(&self, key: &StoreKey, bytes: &[u8]) -> Result<()> {
        self.entries.write().insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &StorePrefix) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !prefix.matches(key));
        Ok(before - entries.len())
    }

    async fn stats(&self, prefix: &StorePrefix) -> Result<BackendStats> {
        let entries = self.entries.read();
        let mut stats = BackendStats::default();
        for (key, bytes) in entries.iter() {
            if prefix.matches(key) {
                stats.entries += 1;
                stats.bytes += bytes.len() as u64;
            }
        }
        Ok(stats)
    }
}

/// Inputs for determining the default cache root directory
#[derive(Debug, Clone)]
struct CacheRootInputs {
    env_cache_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_root_from_inputs(inputs: CacheRootInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) TRACELENS_CACHE_DIR (explicit override)
    // 2) XDG_CACHE_HOME/tracelens
    // 3) OS cache dir/tracelens
    // 4) TMPDIR/tracelens/cache (fallback)
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.env_cache_dir.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("tracelens"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("tracelens"));
    }
    candidates.push(inputs.temp_dir.join("tracelens/cache"));

    for path in candidates {
        if path.exists() {
            let probe = path.join(".write_probe");
            match std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
            {
                Ok(_) => {
                    let _ = std::fs::remove_file(&probe);
                    return Ok(path);
                }
                Err(_) => {
                    // Not writable, try next candidate
                    continue;
                }
            }
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}

/// Resolve the default on-disk cache root
///
/// # Errors
///
/// Returns a configuration error when no candidate directory is writable.
pub fn default_cache_root() -> Result<PathBuf> {
    let inputs = CacheRootInputs {
        env_cache_dir: std::env::var("TRACELENS_CACHE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        xdg_cache_home: std::env::var("XDG_CACHE_HOME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        os_cache_dir: dirs::cache_dir(),
        temp_dir: std::env::temp_dir(),
    };
    cache_root_from_inputs(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(project: &str, session: &str, leaf: &str) -> StoreKey {
        StoreKey::new("items", project, session, leaf)
    }

    #[tokio::test]
    async fn fs_backend_roundtrip_and_layout() {
        let dir = TempDir::new().expect("tempdir");
        let backend = FsBackend::new(dir.path());

        let k = key("projA", "sess1", "my-eval");
        assert_eq!(backend.read(&k).await.expect("read"), None);

        backend.write(&k, b"{\"value\":1}").await.expect("write");
        assert_eq!(
            backend.read(&k).await.expect("read"),
            Some(b"{\"value\":1}".to_vec())
        );
        assert!(
            dir.path()
                .join("items/projA/sess1/my-eval.json")
                .exists()
        );
    }

    #[tokio::test]
    async fn fs_backend_remove_prefix_scopes_to_session() {
        let dir = TempDir::new().expect("tempdir");
        let backend = FsBackend::new(dir.path());

        backend.write(&key("projA", "sess1", "a"), b"1").await.expect("write");
        backend.write(&key("projA", "sess1", "b"), b"2").await.expect("write");
        backend.write(&key("projA", "sess2", "a"), b"3").await.expect("write");

        let removed = backend
            .remove_prefix(&StorePrefix::session("items", "projA", "sess1"))
            .await
            .expect("remove");
        assert_eq!(removed, 2);
        assert_eq!(backend.read(&key("projA", "sess1", "a")).await.expect("read"), None);
        assert!(backend.read(&key("projA", "sess2", "a")).await.expect("read").is_some());
    }

    #[tokio::test]
    async fn fs_backend_stats_counts_entries_and_bytes() {
        let dir = TempDir::new().expect("tempdir");
        let backend = FsBackend::new(dir.path());

        backend.write(&key("projA", "sess1", "a"), b"abcd").await.expect("write");
        backend.write(&key("projB", "sess9", "b"), b"ef").await.expect("write");

        let stats = backend
            .stats(&StorePrefix::namespace("items"))
            .await
            .expect("stats");
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, 6);

        let scoped = backend
            .stats(&StorePrefix::project("items", "projA"))
            .await
            .expect("stats");
        assert_eq!(scoped.entries, 1);
    }

    #[tokio::test]
    async fn memory_backend_matches_fs_semantics() {
        let backend = MemoryBackend::new();
        let k = key("projA", "sess1", "a");

        assert_eq!(backend.read(&k).await.expect("read"), None);
        backend.write(&k, b"x").await.expect("write");
        assert_eq!(backend.read(&k).await.expect("read"), Some(b"x".to_vec()));

        let removed = backend
            .remove_prefix(&StorePrefix::project("items", "projA"))
            .await
            .expect("remove");
        assert_eq!(removed, 1);
        assert_eq!(backend.read(&k).await.expect("read"), None);
    }

    #[test]
    fn sanitize_keeps_keys_inside_the_root() {
        assert_eq!(sanitize_component("sess/../../etc"), "sess_.._.._etc");
        assert_eq!(sanitize_component(".hidden"), "_hidden");
        assert_eq!(sanitize_component("sess1:agent7"), "sess1_agent7");
    }

    #[test]
    fn cache_root_respects_override() {
        let tmp = TempDir::new().expect("tempdir");
        let inputs = CacheRootInputs {
            env_cache_dir: Some(tmp.path().join("override")),
            xdg_cache_home: None,
            os_cache_dir: None,
            temp_dir: std::env::temp_dir(),
        };
        let root = cache_root_from_inputs(inputs).expect("root");
        assert!(root.ends_with("override"));
    }

    #[test]
    fn cache_root_falls_back_to_temp() {
        let inputs = CacheRootInputs {
            env_cache_dir: None,
            xdg_cache_home: None,
            os_cache_dir: None,
            temp_dir: std::env::temp_dir(),
        };
        let root = cache_root_from_inputs(inputs).expect("root");
        assert!(root.starts_with(std::env::temp_dir()));
    }
}
