//! Order-preserving batch execution with capped parallelism

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracelens_core::{Error, Result};

/// Run task factories with at most `limit` executing simultaneously
///
/// The returned vector has one settlement per factory, in input order,
/// regardless of completion order. A failing or panicking task settles its
/// own slot and never aborts or delays siblings; every task runs to
/// completion. An empty input returns immediately; `limit >= factories.len()`
/// is effectively unbounded. A `limit` of zero is treated as one.
pub async fn run_batch<T, F, Fut>(factories: Vec<F>, limit: usize) -> Vec<Result<T>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let total = factories.len();
    if total == 0 {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut join_set = JoinSet::new();
    for (index, factory) in factories.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (index, Err(Error::scheduling("batch semaphore closed")));
            };
            // The factory runs only once a slot is held, and inside the
            // unwind guard so a panic settles this slot alone.
            let settled = AssertUnwindSafe(async move { factory().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(Error::scheduling(format!("batch task {index} panicked")))
                });
            (index, settled)
        });
    }

    let mut slots: Vec<Option<Result<T>>> = std::iter::repeat_with(|| None).take(total).collect();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, settlement)) => slots[index] = Some(settlement),
            Err(join_error) => {
                // Unreachable while the unwind guard holds; a lost slot
                // would surface below as a scheduling settlement.
                tracing::warn!(%join_error, "batch worker lost");
            }
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(Error::scheduling("batch task never settled"))))
        .collect()
}
