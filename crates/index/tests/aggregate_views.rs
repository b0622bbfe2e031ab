//! Incremental sweep behavior: diffing, purging, identity resets

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tracelens_cache::{CacheStore, ContentHasher, KvBackend, MemoryBackend};
use tracelens_core::{
    AggregateItem, CollectedSession, EvalItem, LogSource, Registry, RegistryItem, Result,
    SessionContext, SessionData, StaticLogSource,
};
use tracelens_index::{AggregateEngine, EngineConfig, ViewOutcome};

struct LineEval {
    fingerprint: String,
}

impl RegistryItem for LineEval {
    fn name(&self) -> &str {
        "count-lines"
    }

    fn source_fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[async_trait]
impl EvalItem for LineEval {
    async fn run(&self, ctx: &SessionContext) -> Result<Value> {
        Ok(json!({ "passed": !ctx.data.lines.is_empty(), "lines": ctx.data.lines.len() }))
    }
}

struct FailingEval;

impl RegistryItem for FailingEval {
    fn name(&self) -> &str {
        "always-fails"
    }

    fn source_fingerprint(&self) -> &str {
        "failing v1"
    }
}

#[async_trait]
impl EvalItem for FailingEval {
    async fn run(&self, _ctx: &SessionContext) -> Result<Value> {
        Err(tracelens_core::Error::user_function(
            "always-fails",
            "no verdict section",
        ))
    }
}

/// Sums the line counts collected per session into a single row
struct TotalLines {
    name: String,
    collects: Arc<AtomicUsize>,
}

impl RegistryItem for TotalLines {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_fingerprint(&self) -> &str {
        "total-lines v1"
    }
}

#[async_trait]
impl AggregateItem for TotalLines {
    async fn collect(&self, ctx: &SessionContext) -> Result<Value> {
        self.collects.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "lines": ctx.data.lines.len() }))
    }

    async fn reduce(
        &self,
        sessions: &[CollectedSession],
    ) -> Result<Vec<BTreeMap<String, Value>>> {
        let total: u64 = sessions
            .iter()
            .filter_map(|s| s.values.get(&self.name))
            .filter_map(|v| v["lines"].as_u64())
            .sum();
        let mut row = BTreeMap::new();
        row.insert("total_lines".to_string(), json!(total));
        row.insert("sessions".to_string(), json!(sessions.len()));
        Ok(vec![row])
    }
}

struct BrokenReduce;

impl RegistryItem for BrokenReduce {
    fn name(&self) -> &str {
        "broken"
    }

    fn source_fingerprint(&self) -> &str {
        "broken v1"
    }
}

#[async_trait]
impl AggregateItem for BrokenReduce {
    async fn collect(&self, _ctx: &SessionContext) -> Result<Value> {
        Ok(json!(1))
    }

    async fn reduce(&self, _sessions: &[CollectedSession]) -> Result<Vec<BTreeMap<String, Value>>> {
        Err(tracelens_core::Error::user_function(
            "broken",
            "reduce divides by zero",
        ))
    }
}

fn write_session(source: &StaticLogSource, root: &Path, project: &str, session: &str, lines: &[&str]) {
    let dir = root.join(project);
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(dir.join(format!("{session}.jsonl")), lines.join("\n")).expect("write");
    source.add_session(
        project,
        session,
        SessionData {
            lines: lines.iter().map(|l| (*l).to_string()).collect(),
            entries: Vec::new(),
        },
    );
}

fn registry(collects: &Arc<AtomicUsize>, aggregate_name: &str) -> Arc<Registry> {
    let mut registry = Registry::new();
    registry.register_eval(Arc::new(LineEval {
        fingerprint: "v1".into(),
    }));
    registry.register_aggregate(Arc::new(TotalLines {
        name: aggregate_name.into(),
        collects: Arc::clone(collects),
    }));
    Arc::new(registry)
}

fn engine_over(
    source: &Arc<StaticLogSource>,
    registry: Arc<Registry>,
    backend: &Arc<MemoryBackend>,
) -> AggregateEngine {
    AggregateEngine::new(
        Arc::clone(source) as Arc<dyn LogSource>,
        registry,
        CacheStore::new(Arc::clone(backend) as Arc<dyn KvBackend>),
        Arc::new(ContentHasher::with_stat_ttl(None, Duration::ZERO)),
        EngineConfig::default(),
    )
}

fn report(outcome: ViewOutcome) -> tracelens_index::ViewReport {
    match outcome {
        ViewOutcome::Computed(report) => report,
        ViewOutcome::NoAggregates => panic!("expected a computed view"),
    }
}

#[tokio::test]
async fn no_registered_aggregates_short_circuits() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(StaticLogSource::new(dir.path()));
    let engine = engine_over(&source, Arc::new(Registry::new()), &Arc::new(MemoryBackend::new()));

    let outcome = engine.compute_view("default").await.expect("computes");
    assert!(matches!(outcome, ViewOutcome::NoAggregates));
}

#[tokio::test]
async fn sweep_recomputes_only_changed_sessions() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(StaticLogSource::new(dir.path()));
    write_session(&source, dir.path(), "projA", "sess1", &["a", "b"]);
    write_session(&source, dir.path(), "projA", "sess2", &["c"]);

    let collects = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_over(&source, registry(&collects, "total-lines"), &backend);

    // First sweep computes every session.
    let first = report(engine.compute_view("default").await.expect("sweep"));
    assert_eq!(first.total_sessions, 2);
    assert_eq!(first.tables["total-lines"][0]["total_lines"], json!(3));
    assert_eq!(collects.load(Ordering::SeqCst), 2);

    // Nothing changed: no recomputes.
    let second = report(engine.compute_view("default").await.expect("sweep"));
    assert_eq!(second.total_sessions, 2);
    assert_eq!(collects.load(Ordering::SeqCst), 2);

    // Appending to one session changes its size; only it recomputes.
    write_session(&source, dir.path(), "projA", "sess1", &["a", "b", "c"]);
    let third = report(engine.compute_view("default").await.expect("sweep"));
    assert_eq!(third.tables["total-lines"][0]["total_lines"], json!(4));
    assert_eq!(collects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn deleted_sessions_are_purged_immediately() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(StaticLogSource::new(dir.path()));
    write_session(&source, dir.path(), "projA", "sess1", &["a"]);
    write_session(&source, dir.path(), "projB", "sess2", &["b", "c"]);

    let collects = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_over(&source, registry(&collects, "total-lines"), &backend);

    let first = report(engine.compute_view("default").await.expect("sweep"));
    assert_eq!(first.total_sessions, 2);

    source.remove_session("projB", "sess2");
    let second = report(engine.compute_view("default").await.expect("sweep"));
    assert_eq!(second.total_sessions, 1);
    assert_eq!(second.tables["total-lines"][0]["total_lines"], json!(1));
    assert_eq!(engine.indexed_sessions().await, 1);
}

#[tokio::test]
async fn changed_registration_rebuilds_the_whole_index() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(StaticLogSource::new(dir.path()));
    write_session(&source, dir.path(), "projA", "sess1", &["a"]);
    write_session(&source, dir.path(), "projA", "sess2", &["b"]);

    let collects = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_over(&source, registry(&collects, "total-lines"), &backend);

    report(engine.compute_view("default").await.expect("sweep"));
    assert_eq!(collects.load(Ordering::SeqCst), 2);

    // Renaming the aggregate changes the registration identity and the
    // whole-result cache key, so everything recomputes.
    engine.replace_registry(registry(&collects, "total-lines-v2"));
    let rebuilt = report(engine.compute_view("default").await.expect("sweep"));
    assert_eq!(collects.load(Ordering::SeqCst), 4);
    assert!(rebuilt.tables.contains_key("total-lines-v2"));
}

#[tokio::test]
async fn view_name_is_part_of_the_index_identity() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(StaticLogSource::new(dir.path()));
    write_session(&source, dir.path(), "projA", "sess1", &["a"]);

    let collects = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_over(&source, registry(&collects, "total-lines"), &backend);

    report(engine.compute_view("daily").await.expect("sweep"));
    assert_eq!(engine.indexed_sessions().await, 1);

    // Same registry, different view name: the index is rebuilt, though the
    // whole-result disk cache still spares the collect calls.
    report(engine.compute_view("weekly").await.expect("sweep"));
    assert_eq!(engine.indexed_sessions().await, 1);
    assert_eq!(collects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disk_cache_spares_recomputes_across_engine_restarts() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(StaticLogSource::new(dir.path()));
    write_session(&source, dir.path(), "projA", "sess1", &["a", "b"]);

    let collects = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(MemoryBackend::new());

    let engine = engine_over(&source, registry(&collects, "total-lines"), &backend);
    report(engine.compute_view("default").await.expect("sweep"));
    assert_eq!(collects.load(Ordering::SeqCst), 1);
    drop(engine);

    // A fresh engine has no in-memory index, but the whole-result entries
    // survive on the (shared) backend.
    let revived = engine_over(&source, registry(&collects, "total-lines"), &backend);
    let rebuilt = report(revived.compute_view("default").await.expect("sweep"));
    assert_eq!(rebuilt.total_sessions, 1);
    assert_eq!(rebuilt.tables["total-lines"][0]["total_lines"], json!(2));
    assert_eq!(collects.load(Ordering::SeqCst), 1, "served from disk cache");
}

#[tokio::test]
async fn failing_reduce_empties_only_its_own_table() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(StaticLogSource::new(dir.path()));
    write_session(&source, dir.path(), "projA", "sess1", &["a"]);

    let collects = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    registry.register_eval(Arc::new(LineEval {
        fingerprint: "v1".into(),
    }));
    registry.register_aggregate(Arc::new(TotalLines {
        name: "total-lines".into(),
        collects: Arc::clone(&collects),
    }));
    registry.register_aggregate(Arc::new(BrokenReduce));

    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_over(&source, Arc::new(registry), &backend);

    let view = report(engine.compute_view("default").await.expect("sweep"));
    assert!(view.tables["broken"].is_empty());
    assert_eq!(view.tables["total-lines"].len(), 1);
}

#[tokio::test]
async fn failing_eval_becomes_an_error_value_beside_siblings() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(StaticLogSource::new(dir.path()));
    write_session(&source, dir.path(), "projA", "sess1", &["a"]);

    let collects = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    registry.register_eval(Arc::new(LineEval {
        fingerprint: "v1".into(),
    }));
    registry.register_eval(Arc::new(FailingEval));
    registry.register_aggregate(Arc::new(TotalLines {
        name: "total-lines".into(),
        collects: Arc::clone(&collects),
    }));

    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_over(&source, Arc::new(registry), &backend);

    let view = report(engine.compute_view("default").await.expect("sweep"));
    // The failing eval did not abort the session; its sibling and the
    // aggregate both contributed.
    assert_eq!(view.total_sessions, 1);
    assert_eq!(view.tables["total-lines"][0]["total_lines"], json!(1));

    // The error value is persisted in the whole-result document.
    let key = tracelens_cache::StoreKey::new(
        tracelens_index::VIEW_NAMESPACE,
        "projA",
        "sess1",
        "always-fails+count-lines+total-lines",
    );
    let stored = backend.read(&key).await.expect("read").expect("entry");
    let doc: serde_json::Value = serde_json::from_slice(&stored).expect("json");
    assert!(
        doc["value"]["always-fails"]["error"]
            .as_str()
            .expect("error text")
            .contains("no verdict section")
    );
}
