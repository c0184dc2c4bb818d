use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tboard_core::types::CabinetId;
use tokio::sync::Semaphore;

/// Runs one future per cabinet with at most `limit` in flight.
///
/// A cabinet whose task panicked is absent from the result; callers treat a
/// missing entry as a failed shard.
pub(crate) async fn per_cabinet<T, F, Fut>(
    limit: usize,
    items: Vec<(CabinetId, T)>,
    f: F,
) -> BTreeMap<CabinetId, Fut::Output>
where
    F: Fn(CabinetId, T) -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let mut joinset = tokio::task::JoinSet::new();
    for (cabinet_id, item) in items {
        let sem = sem.clone();
        let fut = f(cabinet_id.clone(), item);
        joinset.spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            (cabinet_id, fut.await)
        });
    }

    let mut out = BTreeMap::new();
    while let Some(joined) = joinset.join_next().await {
        match joined {
            Ok((cabinet_id, output)) => {
                out.insert(cabinet_id, output);
            }
            Err(err) => tracing::error!(error = %err, "shard task aborted"),
        }
    }
    out
}
