//! Registry of user-supplied scoring and enrichment items
//!
//! Items are registered by the host process and treated as opaque by the
//! engine: each exposes a name, a source fingerprint (used for cache
//! invalidation when the item's body changes), an optional condition
//! predicate, and its run/collect/reduce operations.

use crate::session::{CollectedSession, SessionContext};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The kind of a registered per-session item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Grades a session pass/fail with a score
    Eval,
    /// Produces descriptive key-value metadata for a session
    Enrichment,
    /// Manually triggered, free-form output, may read cached sibling results
    Action,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eval => write!(f, "eval"),
            Self::Enrichment => write!(f, "enrichment"),
            Self::Action => write!(f, "action"),
        }
    }
}

/// Common surface of every registered item
pub trait RegistryItem: Send + Sync {
    /// Unique item name within its kind
    fn name(&self) -> &str;

    /// Serialized source of the item's body; hashed so that editing an item
    /// invalidates only that item's cache entries
    fn source_fingerprint(&self) -> &str;

    /// Whether the item applies to this session. Defaults to always-on.
    fn condition(&self, _ctx: &SessionContext) -> bool {
        true
    }
}

/// A registered eval: grades a session
#[async_trait]
pub trait EvalItem: RegistryItem {
    /// Run the eval against a session, producing a verdict value
    async fn run(&self, ctx: &SessionContext) -> Result<Value>;
}

/// A registered enrichment: descriptive metadata for a session
#[async_trait]
pub trait EnrichmentItem: RegistryItem {
    /// Run the enrichment against a session
    async fn run(&self, ctx: &SessionContext) -> Result<Value>;
}

/// A registered action: manually triggered, free-form output
#[async_trait]
pub trait ActionItem: RegistryItem {
    /// Run the action; the context carries cached eval/enrichment values
    async fn run(&self, ctx: &SessionContext) -> Result<Value>;
}

/// A registered aggregate: two-phase collect/reduce across sessions
#[async_trait]
pub trait AggregateItem: RegistryItem {
    /// Collect this session's contribution to the aggregate
    async fn collect(&self, ctx: &SessionContext) -> Result<Value>;

    /// Reduce all collected contributions into tabular rows
    async fn reduce(
        &self,
        sessions: &[CollectedSession],
    ) -> Result<Vec<BTreeMap<String, Value>>>;
}

/// Item registry populated by the host process
///
/// The engine never inspects item bodies; it only needs names, fingerprints,
/// and conditions. Registration order is irrelevant: everything identity-
/// sensitive works over sorted names.
#[derive(Clone, Default)]
pub struct Registry {
    evals: Vec<Arc<dyn EvalItem>>,
    enrichments: Vec<Arc<dyn EnrichmentItem>>,
    actions: Vec<Arc<dyn ActionItem>>,
    aggregates: Vec<Arc<dyn AggregateItem>>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an eval. Re-registering a name replaces the previous item.
    pub fn register_eval(&mut self, item: Arc<dyn EvalItem>) {
        self.evals.retain(|existing| existing.name() != item.name());
        self.evals.push(item);
    }

    /// Register an enrichment. Re-registering a name replaces the previous item.
    pub fn register_enrichment(&mut self, item: Arc<dyn EnrichmentItem>) {
        self.enrichments
            .retain(|existing| existing.name() != item.name());
        self.enrichments.push(item);
    }

    /// Register an action. Re-registering a name replaces the previous item.
    pub fn register_action(&mut self, item: Arc<dyn ActionItem>) {
        self.actions
            .retain(|existing| existing.name() != item.name());
        self.actions.push(item);
    }

    /// Register an aggregate. Re-registering a name replaces the previous item.
    pub fn register_aggregate(&mut self, item: Arc<dyn AggregateItem>) {
        self.aggregates
            .retain(|existing| existing.name() != item.name());
        self.aggregates.push(item);
    }

    /// All registered evals
    #[must_use]
    pub fn evals(&self) -> &[Arc<dyn EvalItem>] {
        &self.evals
    }

    /// All registered enrichments
    #[must_use]
    pub fn enrichments(&self) -> &[Arc<dyn EnrichmentItem>] {
        &self.enrichments
    }

    /// All registered actions
    #[must_use]
    pub fn actions(&self) -> &[Arc<dyn ActionItem>] {
        &self.actions
    }

    /// All registered aggregates
    #[must_use]
    pub fn aggregates(&self) -> &[Arc<dyn AggregateItem>] {
        &self.aggregates
    }

    /// Look up an eval by name
    #[must_use]
    pub fn eval(&self, name: &str) -> Option<&Arc<dyn EvalItem>> {
        self.evals.iter().find(|item| item.name() == name)
    }

    /// Look up an enrichment by name
    #[must_use]
    pub fn enrichment(&self, name: &str) -> Option<&Arc<dyn EnrichmentItem>> {
        self.enrichments.iter().find(|item| item.name() == name)
    }

    /// Look up an action by name
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&Arc<dyn ActionItem>> {
        self.actions.iter().find(|item| item.name() == name)
    }

    /// Look up an aggregate by name
    #[must_use]
    pub fn aggregate(&self, name: &str) -> Option<&Arc<dyn AggregateItem>> {
        self.aggregates.iter().find(|item| item.name() == name)
    }

    /// Sorted names of the per-session items (evals + enrichments)
    ///
    /// This is the item-name list whole-result cache keys are built from.
    #[must_use]
    pub fn session_item_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .evals
            .iter()
            .map(|item| item.name().to_string())
            .chain(self.enrichments.iter().map(|item| item.name().to_string()))
            .collect();
        names.sort();
        names
    }

    /// Sorted names of the registered aggregates
    #[must_use]
    pub fn aggregate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .aggregates
            .iter()
            .map(|item| item.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Deterministic hash of the full registration identity
    ///
    /// Changes whenever any item is added, removed, renamed, or edited; the
    /// aggregate index is discarded wholesale when this changes.
    #[must_use]
    pub fn registration_hash(&self) -> String {
        let mut fingerprints: BTreeMap<String, String> = BTreeMap::new();
        for item in &self.evals {
            fingerprints.insert(
                format!("eval/{}", item.name()),
                item.source_fingerprint().to_string(),
            );
        }
        for item in &self.enrichments {
            fingerprints.insert(
                format!("enrichment/{}", item.name()),
                item.source_fingerprint().to_string(),
            );
        }
        for item in &self.actions {
            fingerprints.insert(
                format!("action/{}", item.name()),
                item.source_fingerprint().to_string(),
            );
        }
        for item in &self.aggregates {
            fingerprints.insert(
                format!("aggregate/{}", item.name()),
                item.source_fingerprint().to_string(),
            );
        }

        let mut hasher = Sha256::new();
        for (key, fingerprint) in &fingerprints {
            hasher.update(key.as_bytes());
            hasher.update(b"\0");
            hasher.update(fingerprint.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }

    /// Find a runnable item by kind and name, erased to a uniform closure seam
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no item of that kind and name is
    /// registered.
    pub fn runnable(&self, kind: ItemKind, name: &str) -> Result<RunnableItem> {
        match kind {
            ItemKind::Eval => self
                .eval(name)
                .cloned()
                .map(RunnableItem::Eval)
                .ok_or_else(|| Error::configuration(format!("No eval registered as '{name}'"))),
            ItemKind::Enrichment => self
                .enrichment(name)
                .cloned()
                .map(RunnableItem::Enrichment)
                .ok_or_else(|| {
                    Error::configuration(format!("No enrichment registered as '{name}'"))
                }),
            ItemKind::Action => self
                .action(name)
                .cloned()
                .map(RunnableItem::Action)
                .ok_or_else(|| Error::configuration(format!("No action registered as '{name}'"))),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("evals", &self.evals.len())
            .field("enrichments", &self.enrichments.len())
            .field("actions", &self.actions.len())
            .field("aggregates", &self.aggregates.len())
            .finish()
    }
}

/// A kind-erased registered item ready to run against a session
#[derive(Clone)]
pub enum RunnableItem {
    /// A registered eval
    Eval(Arc<dyn EvalItem>),
    /// A registered enrichment
    Enrichment(Arc<dyn EnrichmentItem>),
    /// A registered action
    Action(Arc<dyn ActionItem>),
}

impl RunnableItem {
    /// Item name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Eval(item) => item.name(),
            Self::Enrichment(item) => item.name(),
            Self::Action(item) => item.name(),
        }
    }

    /// Source fingerprint for code-hash invalidation
    #[must_use]
    pub fn source_fingerprint(&self) -> &str {
        match self {
            Self::Eval(item) => item.source_fingerprint(),
            Self::Enrichment(item) => item.source_fingerprint(),
            Self::Action(item) => item.source_fingerprint(),
        }
    }

    /// Condition predicate; items whose condition is false are skipped
    #[must_use]
    pub fn condition(&self, ctx: &SessionContext) -> bool {
        match self {
            Self::Eval(item) => item.condition(ctx),
            Self::Enrichment(item) => item.condition(ctx),
            Self::Action(item) => item.condition(ctx),
        }
    }

    /// Run the item against a session
    ///
    /// # Errors
    ///
    /// Propagates the item's own failure as a user-function error.
    pub async fn run(&self, ctx: &SessionContext) -> Result<Value> {
        match self {
            Self::Eval(item) => item.run(ctx).await,
            Self::Enrichment(item) => item.run(ctx).await,
            Self::Action(item) => item.run(ctx).await,
        }
    }
}
