//! Content-addressed result caching for tracelens
//!
//! This crate provides the caching infrastructure for item execution:
//! - Freshness fingerprints for session logs (mtime + size tokens) and for
//!   registered item code (sha256 of the item's source)
//! - TTL + LRU memoization with in-flight coalescing for async functions
//! - A two-tier (whole-result / per-item) disk cache over a pluggable
//!   key-value backend, validated by content and code hashes at read time
//!
//! # Freshness model
//!
//! Session logs are append-only, so an unchanged (mtime, size) pair is
//! trusted as unchanged content. Stored entries carry the hashes they were
//! computed against; a stored hash that no longer matches simply reads as a
//! miss. Nothing is ever swept in the background, and a cache failure is
//! never allowed to fail a computation.

mod error;

pub mod backend;
pub mod hash;
pub mod memo;
pub mod store;

pub use backend::{
    BackendStats, FsBackend, KvBackend, MemoryBackend, StoreKey, StorePrefix, default_cache_root,
};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher, ItemCodeHash};
pub use memo::MemoCache;
pub use store::{CacheStore, ItemMeta, ResultsMeta, StoredItem, StoredResults};
