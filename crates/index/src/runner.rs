//! Cached execution of registered items against sessions
//!
//! The runner is what queue submissions actually execute: consult the
//! per-item cache, run the item on a miss, persist the result best-effort.
//! Actions additionally see their session's cached eval/enrichment values.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracelens_cache::{CacheStore, ContentHash, ContentHasher};
use tracelens_core::{Error, ItemKind, LogSource, Registry, Result, SessionContext};
use tracelens_queue::{BackgroundTask, QueueKey, TaskError, TaskThunk, task_thunk};

/// Namespace for per-item cache entries
pub const ITEM_NAMESPACE: &str = "items";

/// Runs registered items with per-item content-addressed caching
#[derive(Clone)]
pub struct ItemRunner {
    source: Arc<dyn LogSource>,
    registry: Arc<Registry>,
    store: CacheStore,
    hasher: Arc<ContentHasher>,
}

impl ItemRunner {
    /// Create a runner over the given collaborators
    #[must_use]
    pub fn new(
        source: Arc<dyn LogSource>,
        registry: Arc<Registry>,
        store: CacheStore,
        hasher: Arc<ContentHasher>,
    ) -> Self {
        Self {
            source,
            registry,
            store,
            hasher,
        }
    }

    /// Run one item against a session, consulting the cache first
    ///
    /// `force_refresh` bypasses the cache read; the result is still written
    /// back. Items whose condition rejects the session yield `Value::Null`
    /// without caching.
    ///
    /// # Errors
    ///
    /// Unknown items surface as configuration errors; item failures as
    /// user-function errors. Cache trouble never fails the computation.
    pub async fn run_item(
        &self,
        kind: ItemKind,
        project: &str,
        session_id: &str,
        item_name: &str,
        force_refresh: bool,
    ) -> Result<Value> {
        let item = self.registry.runnable(kind, item_name)?;
        let content_hash = self
            .hasher
            .session_hash(&self.source.session_path(project, session_id))
            .await;
        let code_hash = self
            .hasher
            .effective_code_hash(item.name(), item.source_fingerprint())
            .await;

        if !force_refresh {
            let cached = self
                .store
                .get_item(
                    ITEM_NAMESPACE,
                    project,
                    session_id,
                    item_name,
                    &content_hash,
                    &code_hash,
                )
                .await;
            if let Some(hit) = cached {
                tracing::debug!(item = item_name, project, session_id, "item cache hit");
                return Ok(hit);
            }
        }

        let data = self.source.load_session(project, session_id).await?;
        let mut ctx = SessionContext::new(project, session_id, data);
        if kind == ItemKind::Action {
            self.preload_cached_values(&mut ctx, &content_hash).await;
        }

        if !item.condition(&ctx) {
            return Ok(Value::Null);
        }

        let value = item.run(&ctx).await.map_err(|e| match e {
            Error::UserFunction { .. } => e,
            other => Error::user_function(item_name, other.to_string()),
        })?;
        self.store
            .set_item(
                ITEM_NAMESPACE,
                project,
                session_id,
                item_name,
                &content_hash,
                &code_hash,
                value.clone(),
            )
            .await;
        Ok(value)
    }

    /// Build the standard queue thunk for an item
    #[must_use]
    pub fn task(
        &self,
        kind: ItemKind,
        project: impl Into<String>,
        session_id: impl Into<String>,
        item_name: impl Into<String>,
    ) -> TaskThunk {
        let runner = self.clone();
        let project = project.into();
        let session_id = session_id.into();
        let item_name = item_name.into();
        task_thunk(move |force_refresh| async move {
            runner
                .run_item(kind, &project, &session_id, &item_name, force_refresh)
                .await
                .map_err(|e| match e {
                    Error::UserFunction { item, message } => TaskError::failed(item, message),
                    other => TaskError::scheduling(other.to_string()),
                })
        })
    }

    /// Enumerate cache-miss items across all sessions, up to `limit`
    ///
    /// Feeds the queue's background drain: every returned task is a known
    /// miss at scan time. Listing failures degrade to an empty scan.
    pub async fn scan_missing(&self, limit: usize) -> Vec<BackgroundTask> {
        let mut tasks = Vec::new();
        let projects = match self.source.list_projects().await {
            Ok(projects) => projects,
            Err(error) => {
                tracing::warn!(%error, "background scan could not list projects");
                return tasks;
            }
        };

        'outer: for project in projects {
            let sessions = match self.source.list_sessions(&project).await {
                Ok(sessions) => sessions,
                Err(error) => {
                    tracing::warn!(%error, project = %project, "background scan skipping project");
                    continue;
                }
            };
            for session_id in sessions {
                let content_hash = self
                    .hasher
                    .session_hash(&self.source.session_path(&project, &session_id))
                    .await;
                if content_hash.is_empty() {
                    continue;
                }
                for (kind, name, fingerprint) in self.session_items() {
                    if tasks.len() >= limit {
                        break 'outer;
                    }
                    if self
                        .cached_item(&project, &session_id, &name, &fingerprint, &content_hash)
                        .await
                        .is_some()
                    {
                        continue;
                    }
                    let key = QueueKey::new(kind, project.clone(), session_id.clone(), name.clone());
                    let thunk = self.task(kind, project.clone(), session_id.clone(), name);
                    tasks.push(BackgroundTask { key, thunk });
                }
            }
        }
        tasks
    }

    /// Source path of a session, exposed for hosts wiring their own sweeps
    #[must_use]
    pub fn session_path(&self, project: &str, session_id: &str) -> PathBuf {
        self.source.session_path(project, session_id)
    }

    /// (kind, name, fingerprint) of every per-session item
    fn session_items(&self) -> Vec<(ItemKind, String, String)> {
        let mut items: Vec<(ItemKind, String, String)> = self
            .registry
            .evals()
            .iter()
            .map(|item| {
                (
                    ItemKind::Eval,
                    item.name().to_string(),
                    item.source_fingerprint().to_string(),
                )
            })
            .chain(self.registry.enrichments().iter().map(|item| {
                (
                    ItemKind::Enrichment,
                    item.name().to_string(),
                    item.source_fingerprint().to_string(),
                )
            }))
            .collect();
        items.sort_by(|a, b| a.1.cmp(&b.1));
        items
    }

    async fn cached_item(
        &self,
        project: &str,
        session_id: &str,
        name: &str,
        fingerprint: &str,
        content_hash: &ContentHash,
    ) -> Option<Value> {
        let code_hash = self.hasher.effective_code_hash(name, fingerprint).await;
        self.store
            .get_item(
                ITEM_NAMESPACE,
                project,
                session_id,
                name,
                content_hash,
                &code_hash,
            )
            .await
    }

    /// Fill an action's context with its session's cached item values
    async fn preload_cached_values(&self, ctx: &mut SessionContext, content_hash: &ContentHash) {
        let project = ctx.project.clone();
        let session_id = ctx.session_id.clone();
        for (_, name, fingerprint) in self.session_items() {
            if let Some(value) = self
                .cached_item(&project, &session_id, &name, &fingerprint, content_hash)
                .await
            {
                ctx.record(name, value);
            }
        }
    }
}
