//! 📥 Bounded Fetcher: at most `P` downloads at once, every result tagged with its index.
//!
//! 🎬 *[the dispatcher stands at the door with `P` wristbands.]*
//! *[no wristband, no download. the queue behind it is exactly the selection order.]*
//!
//! The dispatcher walks the descriptors in order, acquires a semaphore permit
//! for each, and spawns a worker into a `JoinSet`. A worker fetches, hands the
//! bytes to the spooler, and pushes an [`IndexedPayload`] onto the bounded
//! hand-off queue, holding its permit until the push lands. A full hand-off
//! queue therefore stalls the pool, which is what keeps the reorder buffer small.
//!
//! Failures are per-object: logged, counted, and left as a gap. After every
//! worker has joined, the dispatcher drops the last hand-off sender, which is
//! how the reorder actor learns that nothing more is coming.
//!
//! 🧠 Knowledge graph:
//! - cancellation: the dispatcher stops handing out permits; in-flight fetches race the token
//! - the hand-off sender is cloned per worker, so the queue closes only when the last one is gone

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use async_channel::Sender;

use crate::common::{IndexedPayload, ObjectDescriptor};
use crate::content::Spooler;
use crate::stores::{ObjectStore, StoreBackend};

/// 📊 What the pool did, by index.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct FetchStats {
    pub attempted: usize,
    pub delivered: Vec<usize>,
    pub failed: Vec<usize>,
    /// ✂️ Started, then cut short by cancellation or a closed hand-off queue
    pub abandoned: Vec<usize>,
    pub not_started: Vec<usize>,
}

enum WorkerOutcome {
    Delivered(usize),
    Failed(usize),
    Abandoned(usize),
}

/// 📥 A fixed-size download pool over one store.
#[derive(Debug)]
pub(crate) struct BoundedFetcher {
    store: Arc<StoreBackend>,
    spooler: Spooler,
    parallelism: usize,
}

impl BoundedFetcher {
    pub(crate) fn new(store: Arc<StoreBackend>, spooler: Spooler, parallelism: usize) -> Self {
        Self {
            store,
            spooler,
            parallelism: parallelism.max(1),
        }
    }

    /// 🚀 Spawn the dispatcher. The returned handle resolves once every worker has joined
    /// and the hand-off queue has been released.
    pub(crate) fn start(
        self,
        descriptors: Vec<ObjectDescriptor>,
        handoff: Sender<IndexedPayload>,
        cancel: CancellationToken,
    ) -> JoinHandle<FetchStats> {
        tokio::spawn(self.run(descriptors, handoff, cancel))
    }

    async fn run(
        self,
        descriptors: Vec<ObjectDescriptor>,
        handoff: Sender<IndexedPayload>,
        cancel: CancellationToken,
    ) -> FetchStats {
        let total = descriptors.len();
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut workers = JoinSet::new();
        let mut stats = FetchStats::default();
        let mut pending = descriptors.into_iter();

        debug!(
            "📥 fetch pool starting: {} segment(s), {} at a time",
            total, self.parallelism
        );

        while let Some(descriptor) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                stats.not_started.push(descriptor.sequence_index);
                stats
                    .not_started
                    .extend(pending.by_ref().map(|d| d.sequence_index));
                info!(
                    "🛑 fetch pool: cancelled, {} segment(s) will not be started",
                    stats.not_started.len()
                );
                break;
            };

            stats.attempted += 1;
            workers.spawn(fetch_one(
                Arc::clone(&self.store),
                self.spooler.clone(),
                descriptor,
                handoff.clone(),
                cancel.clone(),
                permit,
            ));

            // -- reap whatever already finished so the set does not grow with N
            while let Some(joined) = workers.try_join_next() {
                record(joined, &mut stats);
            }
        }

        drop(handoff);
        while let Some(joined) = workers.join_next().await {
            record(joined, &mut stats);
        }

        stats.delivered.sort_unstable();
        stats.failed.sort_unstable();
        stats.abandoned.sort_unstable();
        info!(
            "📥 fetch pool drained: {} of {} delivered ({} attempted), {} failed, {} abandoned, {} not started",
            stats.delivered.len(),
            total,
            stats.attempted,
            stats.failed.len(),
            stats.abandoned.len(),
            stats.not_started.len()
        );
        stats
    }
}

fn record(joined: Result<WorkerOutcome, tokio::task::JoinError>, stats: &mut FetchStats) {
    match joined {
        Ok(WorkerOutcome::Delivered(index)) => stats.delivered.push(index),
        Ok(WorkerOutcome::Failed(index)) => stats.failed.push(index),
        Ok(WorkerOutcome::Abandoned(index)) => stats.abandoned.push(index),
        Err(err) => error!("💀 a fetch worker died before reporting back: {}", err),
    }
}

async fn fetch_one(
    store: Arc<StoreBackend>,
    spooler: Spooler,
    descriptor: ObjectDescriptor,
    handoff: Sender<IndexedPayload>,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) -> WorkerOutcome {
    let index = descriptor.sequence_index;
    debug!("📥 fetching '{}' (index {})", descriptor.key, index);

    let fetched = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("🛑 abandoning in-flight fetch of '{}' (index {})", descriptor.key, index);
            return WorkerOutcome::Abandoned(index);
        }
        fetched = store.fetch(&descriptor.key) => fetched,
    };

    let bytes = match fetched {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(
                "💀 fetch of '{}' (index {}) failed, index {} will be missing: {:#}",
                descriptor.key, index, index, err
            );
            return WorkerOutcome::Failed(index);
        }
    };

    let size = bytes.len();
    let content = match spooler.hold(&descriptor, bytes).await {
        Ok(content) => content,
        Err(err) => {
            warn!(
                "💀 could not hold '{}' (index {}) after download: {:#}",
                descriptor.key, index, err
            );
            return WorkerOutcome::Failed(index);
        }
    };
    debug!("✅ fetched '{}' (index {}, {} bytes)", descriptor.key, index, size);

    match handoff.send(IndexedPayload::new(descriptor, content)).await {
        Ok(()) => WorkerOutcome::Delivered(index),
        Err(async_channel::SendError(payload)) => {
            payload.release();
            WorkerOutcome::Abandoned(index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::SpoolConfig;
    use crate::stores::InMemoryStore;
    use std::time::Duration;

    fn key(i: usize) -> String {
        format!("pid/rds_log_x_{}", 1_700_000_000 + i)
    }

    fn descriptors(n: usize) -> Vec<ObjectDescriptor> {
        (0..n)
            .map(|i| ObjectDescriptor::new(key(i), 1_700_000_000 + i as i64, i))
            .collect()
    }

    fn memory_spooler() -> Spooler {
        Spooler::new(SpoolConfig {
            enabled: false,
            dir: None,
        })
    }

    async fn run_pool(
        store: &InMemoryStore,
        n: usize,
        parallelism: usize,
        cancel: CancellationToken,
    ) -> anyhow::Result<(FetchStats, Vec<usize>)> {
        let (tx, rx) = async_channel::bounded(3 * parallelism);
        let fetcher = BoundedFetcher::new(
            Arc::new(StoreBackend::InMemory(store.clone())),
            memory_spooler(),
            parallelism,
        );
        let handle = fetcher.start(descriptors(n), tx, cancel);

        let mut arrived = Vec::new();
        while let Ok(payload) = rx.recv().await {
            arrived.push(payload.index);
        }
        Ok((handle.await?, arrived))
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_pool_never_exceeds_its_wristbands() -> anyhow::Result<()> {
        let store = (0..12).fold(InMemoryStore::new(), |store, i| {
            store
                .with_object(key(i), format!("segment {}", i))
                .with_delay(key(i), Duration::from_millis(50 + (i as u64 % 4) * 10))
        });

        let (stats, mut arrived) = run_pool(&store, 12, 3, CancellationToken::new()).await?;

        assert!(store.max_in_flight() <= 3, "saw {} in flight", store.max_in_flight());
        assert_eq!(store.fetch_calls(), 12);
        assert_eq!(stats.attempted, 12);
        assert_eq!(stats.delivered, (0..12).collect::<Vec<_>>());
        arrived.sort_unstable();
        assert_eq!(arrived, (0..12).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_fetch_leaves_a_hole() -> anyhow::Result<()> {
        let store = (0..5)
            .fold(InMemoryStore::new(), |store, i| store.with_object(key(i), "x"))
            .with_failure(key(2));

        let (stats, mut arrived) = run_pool(&store, 5, 2, CancellationToken::new()).await?;

        assert_eq!(stats.failed, vec![2]);
        assert_eq!(stats.delivered, vec![0, 1, 3, 4]);
        arrived.sort_unstable();
        assert_eq!(arrived, vec![0, 1, 3, 4]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_cancellation_means_nobody_gets_in() -> anyhow::Result<()> {
        let store = (0..4).fold(InMemoryStore::new(), |store, i| store.with_object(key(i), "x"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (stats, arrived) = run_pool(&store, 4, 2, cancel).await?;

        assert_eq!(store.fetch_calls(), 0);
        assert_eq!(stats.attempted, 0);
        assert_eq!(stats.not_started, vec![0, 1, 2, 3]);
        assert!(arrived.is_empty());
        Ok(())
    }
}
