//! Cached item execution: hit/miss behavior, invalidation, queue wiring

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;
use tracelens_cache::{CacheStore, ContentHasher, MemoryBackend};
use tracelens_core::{
    EvalItem, ItemKind, Registry, RegistryItem, Result, SessionContext, SessionData,
    StaticLogSource,
};
use tracelens_index::ItemRunner;
use tracelens_queue::{Priority, QueueKey, SubmitOpts, TaskQueue};

struct CountingEval {
    name: String,
    fingerprint: String,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    applies: bool,
}

impl RegistryItem for CountingEval {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn condition(&self, _ctx: &SessionContext) -> bool {
        self.applies
    }
}

#[async_trait]
impl EvalItem for CountingEval {
    async fn run(&self, ctx: &SessionContext) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        Ok(json!({ "passed": true, "lines": ctx.data.lines.len() }))
    }
}

struct EchoAction {
    calls: Arc<AtomicUsize>,
}

impl RegistryItem for EchoAction {
    fn name(&self) -> &str {
        "summarize"
    }

    fn source_fingerprint(&self) -> &str {
        "action v1"
    }
}

#[async_trait]
impl tracelens_core::ActionItem for EchoAction {
    async fn run(&self, ctx: &SessionContext) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Actions read their session's cached eval values from the context.
        Ok(json!({ "seen": ctx.value("count-lines").cloned() }))
    }
}

struct Fixture {
    dir: TempDir,
    source: Arc<StaticLogSource>,
    store: CacheStore,
    calls: Arc<AtomicUsize>,
}

fn eval_item(calls: &Arc<AtomicUsize>, fingerprint: &str, delay: Duration) -> Arc<dyn EvalItem> {
    Arc::new(CountingEval {
        name: "count-lines".into(),
        fingerprint: fingerprint.into(),
        delay,
        calls: Arc::clone(calls),
        applies: true,
    })
}

fn fixture(fingerprint: &str, delay: Duration) -> (Fixture, ItemRunner) {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(StaticLogSource::new(dir.path()));
    write_session(&source, dir.path(), "projA", "sess1", &["{\"role\":\"user\"}"]);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    registry.register_eval(eval_item(&calls, fingerprint, delay));

    let store = CacheStore::new(Arc::new(MemoryBackend::new()));
    let runner = ItemRunner::new(
        Arc::clone(&source) as Arc<dyn tracelens_core::LogSource>,
        Arc::new(registry),
        store.clone(),
        Arc::new(ContentHasher::with_stat_ttl(None, Duration::ZERO)),
    );
    (
        Fixture {
            dir,
            source,
            store,
            calls,
        },
        runner,
    )
}

fn write_session(
    source: &Arc<StaticLogSource>,
    root: &std::path::Path,
    project: &str,
    session: &str,
    lines: &[&str],
) {
    let dir = root.join(project);
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(dir.join(format!("{session}.jsonl")), lines.join("\n")).expect("write");
    source.add_session(
        project,
        session,
        SessionData {
            lines: lines.iter().map(|l| (*l).to_string()).collect(),
            entries: lines
                .iter()
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect(),
        },
    );
}

#[tokio::test]
async fn repeat_run_hits_the_item_cache() {
    let (fx, runner) = fixture("v1", Duration::ZERO);

    let first = runner
        .run_item(ItemKind::Eval, "projA", "sess1", "count-lines", false)
        .await
        .expect("runs");
    let second = runner
        .run_item(ItemKind::Eval, "projA", "sess1", "count-lines", false)
        .await
        .expect("cached");

    assert_eq!(first, second);
    assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn force_refresh_bypasses_the_cache_read() {
    let (fx, runner) = fixture("v1", Duration::ZERO);

    runner
        .run_item(ItemKind::Eval, "projA", "sess1", "count-lines", false)
        .await
        .expect("runs");
    runner
        .run_item(ItemKind::Eval, "projA", "sess1", "count-lines", true)
        .await
        .expect("reruns");

    assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn editing_an_item_invalidates_only_its_own_entries() {
    let (fx, _unused) = fixture("v1", Duration::ZERO);
    let other_calls = Arc::new(AtomicUsize::new(0));

    let runner_with = |count_lines_fingerprint: &str| {
        let mut registry = Registry::new();
        registry.register_eval(eval_item(&fx.calls, count_lines_fingerprint, Duration::ZERO));
        registry.register_eval(Arc::new(CountingEval {
            name: "stable".into(),
            fingerprint: "stable v1".into(),
            delay: Duration::ZERO,
            calls: Arc::clone(&other_calls),
            applies: true,
        }));
        ItemRunner::new(
            Arc::clone(&fx.source) as Arc<dyn tracelens_core::LogSource>,
            Arc::new(registry),
            fx.store.clone(),
            Arc::new(ContentHasher::with_stat_ttl(None, Duration::ZERO)),
        )
    };

    // Warm both caches.
    let warm = runner_with("v1");
    warm.run_item(ItemKind::Eval, "projA", "sess1", "count-lines", false)
        .await
        .expect("warm");
    warm.run_item(ItemKind::Eval, "projA", "sess1", "stable", false)
        .await
        .expect("warm");
    assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    assert_eq!(other_calls.load(Ordering::SeqCst), 1);

    // "Edit" count-lines: same store, new fingerprint.
    let edited = runner_with("v2 edited");
    edited
        .run_item(ItemKind::Eval, "projA", "sess1", "count-lines", false)
        .await
        .expect("miss after edit");
    edited
        .run_item(ItemKind::Eval, "projA", "sess1", "stable", false)
        .await
        .expect("still cached");

    assert_eq!(fx.calls.load(Ordering::SeqCst), 2, "edited item reran");
    assert_eq!(other_calls.load(Ordering::SeqCst), 1, "sibling cache intact");
}

#[tokio::test]
async fn rejected_condition_yields_null_without_caching() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(StaticLogSource::new(dir.path()));
    write_session(&source, dir.path(), "projA", "sess1", &["{}"]);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    registry.register_eval(Arc::new(CountingEval {
        name: "count-lines".into(),
        fingerprint: "v1".into(),
        delay: Duration::ZERO,
        calls: Arc::clone(&calls),
        applies: false,
    }));
    let store = CacheStore::new(Arc::new(MemoryBackend::new()));
    let runner = ItemRunner::new(
        source as Arc<dyn tracelens_core::LogSource>,
        Arc::new(registry),
        store.clone(),
        Arc::new(ContentHasher::with_stat_ttl(None, Duration::ZERO)),
    );

    let value = runner
        .run_item(ItemKind::Eval, "projA", "sess1", "count-lines", false)
        .await
        .expect("skips");
    assert_eq!(value, Value::Null);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.stats("items").await.entries, 0);
}

#[tokio::test]
async fn unknown_item_is_a_configuration_error() {
    let (_fx, runner) = fixture("v1", Duration::ZERO);
    let err = runner
        .run_item(ItemKind::Eval, "projA", "sess1", "no-such-eval", false)
        .await
        .expect_err("unknown");
    assert!(matches!(err, tracelens_core::Error::Configuration { .. }));
}

#[tokio::test]
async fn action_reads_cached_sibling_values() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(StaticLogSource::new(dir.path()));
    write_session(&source, dir.path(), "projA", "sess1", &["{}", "{}"]);

    let eval_calls = Arc::new(AtomicUsize::new(0));
    let action_calls = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    registry.register_eval(eval_item(&eval_calls, "v1", Duration::ZERO));
    registry.register_action(Arc::new(EchoAction {
        calls: Arc::clone(&action_calls),
    }));

    let runner = ItemRunner::new(
        source as Arc<dyn tracelens_core::LogSource>,
        Arc::new(registry),
        CacheStore::new(Arc::new(MemoryBackend::new())),
        Arc::new(ContentHasher::with_stat_ttl(None, Duration::ZERO)),
    );

    // Prime the eval cache, then run the action.
    runner
        .run_item(ItemKind::Eval, "projA", "sess1", "count-lines", false)
        .await
        .expect("eval");
    let output = runner
        .run_item(ItemKind::Action, "projA", "sess1", "summarize", false)
        .await
        .expect("action");

    assert_eq!(output["seen"]["lines"], json!(2));
    assert_eq!(action_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn queue_submissions_coalesce_onto_one_run() {
    let (fx, runner) = fixture("v1", Duration::from_millis(50));
    let queue = TaskQueue::with_defaults();
    let key = QueueKey::new(ItemKind::Eval, "projA", "sess1", "count-lines");
    let opts = SubmitOpts {
        priority: Priority::High,
        force_refresh: false,
    };

    let first = queue.submit(
        key.clone(),
        runner.task(ItemKind::Eval, "projA", "sess1", "count-lines"),
        opts,
    );
    let second = queue.submit(
        key,
        runner.task(ItemKind::Eval, "projA", "sess1", "count-lines"),
        opts,
    );

    let (a, b) = tokio::join!(first, second);
    let a = a.expect("first settles");
    let b = b.expect("second settles");
    assert_eq!(a, b);
    assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scan_missing_reports_only_cache_misses() {
    let (fx, runner) = fixture("v1", Duration::ZERO);

    let missing = runner.scan_missing(10).await;
    assert_eq!(missing.len(), 1, "one eval, one session, no cache yet");

    runner
        .run_item(ItemKind::Eval, "projA", "sess1", "count-lines", false)
        .await
        .expect("fills cache");
    assert!(runner.scan_missing(10).await.is_empty());

    // A second session reopens exactly one miss; limit zero reports nothing.
    write_session(
        &fx.source,
        fx.dir.path(),
        "projA",
        "sess2",
        &["{}", "{}"],
    );
    assert_eq!(runner.scan_missing(10).await.len(), 1);
    assert!(runner.scan_missing(0).await.is_empty());
}
