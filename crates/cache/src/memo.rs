//! TTL + LRU memoization for async computations
//!
//! Wraps arbitrary async functions with lazy TTL expiry, in-flight
//! coalescing, and optional bounded size with least-recently-used eviction.
//! Both the TTL and the LRU bookkeeping are evaluated only at access time;
//! nothing is swept in the background.

use crate::{Error, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Cloneable failure shared by every caller attached to one computation
#[derive(Debug, Clone)]
struct SharedFailure(String);

type SharedOutcome<V> = std::result::Result<V, SharedFailure>;
type InFlight<V> = Shared<BoxFuture<'static, SharedOutcome<V>>>;

enum Slot<V> {
    Ready { value: V, stored_at: Instant },
    InFlight(InFlight<V>),
}

/// Outcome of re-checking the map after building a candidate computation
enum Race<V> {
    Hit(V),
    Attach(InFlight<V>),
    Miss,
}

/// Memoization cache for a single-argument async function
///
/// Concurrent calls for the same unexpired key share one underlying
/// invocation and observe its eventual value or failure. Errors are never
/// retained past settlement, so the next call after a failure recomputes.
pub struct MemoCache<K, V> {
    entries: Mutex<LruCache<K, Slot<V>>>,
    ttl: Duration,
}

impl<K, V> MemoCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Send + Sync + 'static,
{
    /// Create an unbounded memo cache with the given TTL
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            ttl,
        }
    }

    /// Create a bounded memo cache with LRU eviction beyond `max_size`
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `max_size` is zero.
    pub fn with_max_size(ttl: Duration, max_size: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_size)
            .ok_or_else(|| Error::configuration("Memo cache capacity must be non-zero"))?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        })
    }

    /// Return the cached value for `key`, computing it at most once
    ///
    /// Any access, hit or fresh compute, marks the entry most recently
    /// used. Entries older than the TTL are treated as absent.
    ///
    /// # Errors
    ///
    /// A failing computation surfaces as [`Error::Coalesced`] carrying the
    /// original failure text, identically for every attached caller.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(hit) = self.lookup(&key) {
            return match hit {
                Slot::Ready { value, .. } => Ok(value),
                Slot::InFlight(shared) => settle(shared.await),
            };
        }

        let fut: InFlight<V> = compute()
            .map(|res| res.map_err(|e| SharedFailure(e.to_string())))
            .boxed()
            .shared();

        // Another task may have registered between the lookup and here;
        // attach to it instead of computing twice.
        let fut = {
            let mut entries = self.entries.lock();
            let race = match entries.get(&key) {
                Some(Slot::Ready { value, stored_at }) if stored_at.elapsed() < self.ttl => {
                    Race::Hit(value.clone())
                }
                Some(Slot::InFlight(existing)) => Race::Attach(existing.clone()),
                _ => Race::Miss,
            };
            match race {
                Race::Hit(value) => return Ok(value),
                Race::Attach(existing) => existing,
                Race::Miss => {
                    entries.put(key.clone(), Slot::InFlight(fut.clone()));
                    fut
                }
            }
        };

        let outcome = fut.await;
        {
            let mut entries = self.entries.lock();
            match &outcome {
                Ok(value) => {
                    entries.put(
                        key,
                        Slot::Ready {
                            value: value.clone(),
                            stored_at: Instant::now(),
                        },
                    );
                }
                Err(_) => {
                    // Drop the in-flight slot so the next caller retries,
                    // unless a newer computation already replaced it.
                    if matches!(entries.peek(&key), Some(Slot::InFlight(_))) {
                        entries.pop(&key);
                    }
                }
            }
        }
        settle(outcome)
    }

    /// Fetch a live slot for the key, popping expired entries lazily
    fn lookup(&self, key: &K) -> Option<Slot<V>> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(Slot::Ready { value, stored_at }) if stored_at.elapsed() < self.ttl => {
                return Some(Slot::Ready {
                    value: value.clone(),
                    stored_at: *stored_at,
                });
            }
            Some(Slot::InFlight(shared)) => return Some(Slot::InFlight(shared.clone())),
            Some(Slot::Ready { .. }) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    /// Drop a single entry
    pub fn invalidate(&self, key: &K) {
        self.entries.lock().pop(key);
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of live entries (expired entries still count until accessed)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true when the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn settle<V>(outcome: SharedOutcome<V>) -> Result<V> {
    outcome.map_err(|SharedFailure(message)| Error::coalesced(message))
}
