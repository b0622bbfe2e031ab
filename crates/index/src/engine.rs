//! Incremental aggregate index
//!
//! Aggregate views sweep every session of every project. Re-running the
//! per-session pipeline on each request would dwarf the actual reduce work,
//! so the engine retains prior per-session contributions and recomputes only
//! sessions whose identity or content changed. The index lives in memory for
//! the life of the engine; only the disk cache survives a restart.

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracelens_cache::{CacheStore, ContentHash, ContentHasher};
use tracelens_core::{
    CollectedSession, LogSource, Registry, Result, SessionContext, session_key,
};
use tracelens_queue::run_batch;

/// Namespace for whole-result (per-sweep) cache entries
pub const VIEW_NAMESPACE: &str = "views";

/// Engine tuning; defaults suit a few hundred sessions per sweep
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Parallelism for project/session listing
    pub discovery_limit: usize,
    /// Parallelism for content hashing
    pub hash_limit: usize,
    /// Parallelism for session recomputation
    pub recompute_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            discovery_limit: 8,
            hash_limit: 16,
            recompute_limit: 4,
        }
    }
}

/// Outcome of a view computation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ViewOutcome {
    /// The view was computed
    Computed(ViewReport),
    /// No aggregates are registered; there is nothing to compute
    NoAggregates,
}

/// A computed aggregate view
#[derive(Debug, Clone, Serialize)]
pub struct ViewReport {
    /// Rows per aggregate, keyed by aggregate name
    pub tables: BTreeMap<String, Vec<BTreeMap<String, Value>>>,
    /// Sessions contributing to the view
    pub total_sessions: usize,
    /// Wall-clock sweep time
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexIdentity {
    view_name: String,
    registration_hash: String,
    aggregate_names: Vec<String>,
}

#[derive(Default)]
struct AggregateIndex {
    collected: HashMap<String, CollectedSession>,
    content_hashes: HashMap<String, ContentHash>,
}

/// Collaborators a sweep carries into its bounded batches
#[derive(Clone)]
struct Sweep {
    source: Arc<dyn LogSource>,
    registry: Arc<Registry>,
    store: CacheStore,
    hasher: Arc<ContentHasher>,
    cache_names: Arc<Vec<String>>,
}

/// Incremental aggregate view computation
///
/// Owned by the host process and shared by reference; the former ambient
/// singleton became this constructor-configured object. The registry can be
/// swapped when the host reloads user functions; the next sweep notices the
/// identity change and rebuilds from scratch.
pub struct AggregateEngine {
    source: Arc<dyn LogSource>,
    registry: RwLock<Arc<Registry>>,
    store: CacheStore,
    hasher: Arc<ContentHasher>,
    config: EngineConfig,
    index: Mutex<Option<(IndexIdentity, AggregateIndex)>>,
}

impl AggregateEngine {
    /// Create an engine over the given collaborators
    #[must_use]
    pub fn new(
        source: Arc<dyn LogSource>,
        registry: Arc<Registry>,
        store: CacheStore,
        hasher: Arc<ContentHasher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            source,
            registry: RwLock::new(registry),
            store,
            hasher,
            config,
            index: Mutex::new(None),
        }
    }

    /// Swap in a reloaded registry
    ///
    /// The in-memory index is not touched here; the next sweep's identity
    /// check discards it if the registration actually changed.
    pub fn replace_registry(&self, registry: Arc<Registry>) {
        *self.registry.write() = registry;
    }

    /// Compute an aggregate view, recomputing only changed sessions
    ///
    /// Sweeps are serialized; concurrent callers queue on the index lock.
    ///
    /// # Errors
    ///
    /// Only project discovery can fail the sweep as a whole; every
    /// per-session and per-aggregate failure degrades to that session or
    /// aggregate alone.
    pub async fn compute_view(&self, view_name: &str) -> Result<ViewOutcome> {
        let registry = self.registry.read().clone();
        if registry.aggregates().is_empty() {
            return Ok(ViewOutcome::NoAggregates);
        }
        let started = Instant::now();

        let mut cache_names = registry.session_item_names();
        cache_names.extend(registry.aggregate_names());
        cache_names.sort();
        cache_names.dedup();
        let sweep = Sweep {
            source: Arc::clone(&self.source),
            registry: Arc::clone(&registry),
            store: self.store.clone(),
            hasher: Arc::clone(&self.hasher),
            cache_names: Arc::new(cache_names),
        };

        let identity = IndexIdentity {
            view_name: view_name.to_string(),
            registration_hash: registry.registration_hash(),
            aggregate_names: registry.aggregate_names(),
        };

        let mut guard = self.index.lock().await;
        if guard.as_ref().is_some_and(|(current, _)| *current != identity) {
            // Not an error: the registration changed under us, so every
            // retained contribution is suspect. Start over.
            tracing::debug!(view = view_name, "registration identity changed; index reset");
            *guard = None;
        }
        let (_, index) = guard.get_or_insert_with(|| (identity, AggregateIndex::default()));

        // Discovery: full current key set, listings bounded.
        let projects = self.source.list_projects().await?;
        let listings = run_batch(
            projects
                .into_iter()
                .map(|project| {
                    let source = Arc::clone(&self.source);
                    move || async move {
                        let sessions = source.list_sessions(&project).await?;
                        Ok((project, sessions))
                    }
                })
                .collect(),
            self.config.discovery_limit,
        )
        .await;

        let mut current: Vec<(String, String)> = Vec::new();
        for listing in listings {
            match listing {
                Ok((project, sessions)) => {
                    current.extend(sessions.into_iter().map(|s| (project.clone(), s)));
                }
                Err(error) => tracing::warn!(%error, "project listing failed; skipping"),
            }
        }
        let current_keys: HashSet<String> = current
            .iter()
            .map(|(project, session_id)| session_key(project, session_id))
            .collect();

        // Deletion: a session gone from disk leaves the index immediately.
        index.collected.retain(|key, _| current_keys.contains(key));
        index
            .content_hashes
            .retain(|key, _| current_keys.contains(key));

        // Hashing: schedule new or changed sessions for recompute.
        let hashes = run_batch(
            current
                .iter()
                .cloned()
                .map(|(project, session_id)| {
                    let source = Arc::clone(&self.source);
                    let hasher = Arc::clone(&self.hasher);
                    move || async move {
                        let hash = hasher
                            .session_hash(&source.session_path(&project, &session_id))
                            .await;
                        Ok((project, session_id, hash))
                    }
                })
                .collect(),
            self.config.hash_limit,
        )
        .await;

        let mut scheduled: Vec<(String, String, ContentHash)> = Vec::new();
        for hashed in hashes.into_iter().flatten() {
            let (project, session_id, hash) = hashed;
            let key = session_key(&project, &session_id);
            let known = index.content_hashes.get(&key);
            if hash.is_empty() || known != Some(&hash) {
                scheduled.push((project, session_id, hash));
            }
        }

        // Recompute changed sessions in bounded batches. Per-session
        // failures are carried back alongside the key so the stale entry
        // can be dropped and retried next sweep.
        let recomputed = run_batch(
            scheduled
                .into_iter()
                .map(|(project, session_id, hash)| {
                    let sweep = sweep.clone();
                    move || async move {
                        let outcome = sweep.recompute(&project, &session_id, &hash).await;
                        Ok((project, session_id, hash, outcome))
                    }
                })
                .collect(),
            self.config.recompute_limit,
        )
        .await;

        for (project, session_id, hash, outcome) in recomputed.into_iter().flatten() {
            let key = session_key(&project, &session_id);
            match outcome {
                Ok(collected) => {
                    index.content_hashes.insert(key.clone(), hash);
                    index.collected.insert(key, collected);
                }
                Err(error) => {
                    tracing::warn!(
                        %error,
                        project = %project,
                        session_id = %session_id,
                        "session recompute failed"
                    );
                    index.collected.remove(&key);
                    index.content_hashes.remove(&key);
                }
            }
        }

        // Reduce: each aggregate sees the full current session set.
        let mut sessions: Vec<CollectedSession> = index.collected.values().cloned().collect();
        sessions.sort_by(|a, b| a.key().cmp(&b.key()));

        let mut tables = BTreeMap::new();
        for aggregate in registry.aggregates() {
            let rows = match aggregate.reduce(&sessions).await {
                Ok(rows) => rows,
                Err(error) => {
                    // Keep the view renderable; only this aggregate goes empty.
                    tracing::warn!(%error, aggregate = aggregate.name(), "reduce failed");
                    Vec::new()
                }
            };
            tables.insert(aggregate.name().to_string(), rows);
        }

        Ok(ViewOutcome::Computed(ViewReport {
            tables,
            total_sessions: sessions.len(),
            total_duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }))
    }

    /// Number of sessions currently held in the index
    pub async fn indexed_sessions(&self) -> usize {
        self.index
            .lock()
            .await
            .as_ref()
            .map_or(0, |(_, index)| index.collected.len())
    }
}

impl Sweep {
    /// Rebuild one session's contribution, disk cache first
    async fn recompute(
        &self,
        project: &str,
        session_id: &str,
        content_hash: &ContentHash,
    ) -> Result<CollectedSession> {
        if let Some(values) = self
            .store
            .get_results(
                VIEW_NAMESPACE,
                project,
                session_id,
                &self.cache_names,
                content_hash,
            )
            .await
        {
            return Ok(CollectedSession {
                project: project.to_string(),
                session_id: session_id.to_string(),
                values,
            });
        }

        let data = self.source.load_session(project, session_id).await?;
        let mut ctx = SessionContext::new(project, session_id, data);

        // Per-session items first; their values feed aggregate conditions.
        // An item failure becomes an error value beside its successful
        // siblings, never an aborted session.
        for item in self.registry.evals() {
            if !item.condition(&ctx) {
                continue;
            }
            let outcome = item.run(&ctx).await;
            record_outcome(&mut ctx, item.name(), outcome);
        }
        for item in self.registry.enrichments() {
            if !item.condition(&ctx) {
                continue;
            }
            let outcome = item.run(&ctx).await;
            record_outcome(&mut ctx, item.name(), outcome);
        }
        for aggregate in self.registry.aggregates() {
            if !aggregate.condition(&ctx) {
                continue;
            }
            match aggregate.collect(&ctx).await {
                Ok(value) => ctx.record(aggregate.name(), value),
                Err(error) => {
                    tracing::warn!(
                        %error,
                        aggregate = aggregate.name(),
                        project,
                        session_id,
                        "collect failed; session skipped for this aggregate"
                    );
                }
            }
        }

        self.store
            .set_results(
                VIEW_NAMESPACE,
                project,
                session_id,
                &self.cache_names,
                content_hash,
                ctx.values.clone(),
            )
            .await;

        Ok(CollectedSession {
            project: project.to_string(),
            session_id: session_id.to_string(),
            values: ctx.values,
        })
    }
}

/// Record an item's value, or an error value in its place
fn record_outcome(ctx: &mut SessionContext, name: &str, outcome: Result<Value>) {
    match outcome {
        Ok(value) => ctx.record(name, value),
        Err(error) => ctx.record(name, json!({ "error": error.to_string() })),
    }
}
