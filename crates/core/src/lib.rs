//! Core types for the tracelens engine
//!
//! tracelens runs user-registered scoring and enrichment functions against
//! append-only agent session logs, under a strict concurrency ceiling and
//! behind a content-addressed result cache. This crate holds the pieces the
//! other engine crates share:
//!
//! - The error taxonomy ([`Error`], [`Result`])
//! - The item registry model ([`Registry`] and the item traits)
//! - The log source boundary ([`LogSource`])
//! - Session data types threaded through item execution

mod error;
pub mod registry;
pub mod session;
pub mod source;

pub use error::{Error, Result};
pub use registry::{
    ActionItem, AggregateItem, EnrichmentItem, EvalItem, ItemKind, Registry, RegistryItem,
    RunnableItem,
};
pub use session::{CollectedSession, SessionContext, SessionData, session_key};
pub use source::{LogSource, StaticLogSource};
