//! 🧵 Pipeline Orchestrator: selector → fetch pool → reorder actor → one ordered output.
//!
//! 🎬 *[the supervisor does not fetch. the supervisor does not reorder.]*
//! *[the supervisor waits, and then writes the report. management.]*
//!
//! ```text
//!  select_segments ──▶ BoundedFetcher ──(hand-off, 3P)──▶ ReorderActor ──(output, P)──▶ consumer
//!                      P workers                          single owner
//! ```
//!
//! `Pipeline::start` does the listing inline, so a bad prefix, a dead bucket or
//! broken credentials come back as an `Err` before any worker exists. After that
//! everything is a task, and the consumer only sees a channel that yields
//! segments in index order and then closes, once.
//!
//! 🧠 Knowledge graph:
//! - the caller's token is never cancelled by us; the pipeline runs on a child token
//! - the output closes when the reorder actor drops its sender, which happens only
//!   after the hand-off queue closed, which happens only after every worker joined
//! - `join()` awaits the supervisor, which awaits the pool and then the actor

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_channel::Receiver;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app_config::RuntimeConfig;
use crate::common::IndexedPayload;
use crate::content::Spooler;
use crate::fetcher::{BoundedFetcher, FetchStats};
use crate::progress::ProgressMetrics;
use crate::reorder::{AdmissionGate, GapPolicy, ReorderActor, ReorderBuffer, ReorderStats};
use crate::selector::{TimeWindow, select_segments};
use crate::stores::StoreBackend;

/// 📋 The post-mortem of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    /// 📦 Segments selected
    pub total: usize,
    /// 📥 Segments successfully downloaded and handed off
    pub fetched: usize,
    /// 🚀 Segments emitted to the consumer
    pub emitted: usize,
    /// 🕳️ Selected indices that never reached the reorder buffer
    pub missing_indices: Vec<usize>,
    /// 🗑️ Indices that reached the buffer but were released without emission
    pub stranded_indices: Vec<usize>,
    pub cancelled: bool,
}

impl PipelineReport {
    fn new(total: usize, fetch: &FetchStats, reorder: &ReorderStats) -> Self {
        let mut delivered = vec![false; total];
        for &index in &fetch.delivered {
            if let Some(slot) = delivered.get_mut(index) {
                *slot = true;
            }
        }
        let missing_indices = delivered
            .iter()
            .enumerate()
            .filter(|(_, delivered)| !**delivered)
            .map(|(index, _)| index)
            .collect();

        Self {
            total,
            fetched: fetch.delivered.len(),
            emitted: reorder.emitted,
            missing_indices,
            stranded_indices: reorder.stranded_indices.clone(),
            cancelled: reorder.cancelled,
        }
    }

    /// ✅ Every selected segment made it downstream.
    pub fn is_complete(&self) -> bool {
        self.emitted == self.total
    }
}

/// 🧵 A validated pipeline over one store. Cheap to start more than once.
#[derive(Debug)]
pub struct Pipeline {
    store: Arc<StoreBackend>,
    gate: AdmissionGate,
    runtime: RuntimeConfig,
}

impl Pipeline {
    /// 🔧 Validate the runtime knobs up front.
    pub fn new(store: StoreBackend, runtime: &RuntimeConfig) -> Result<Self> {
        let gate = runtime.validate()?;
        Ok(Self {
            store: Arc::new(store),
            gate,
            runtime: runtime.clone(),
        })
    }

    /// 🚀 Select, then spin up the pool and the reorder actor.
    ///
    /// Listing errors are returned here. Everything after that ends up in the
    /// [`PipelineReport`] from [`PipelineHandle::join`].
    pub async fn start(
        &self,
        prefix: &str,
        window: TimeWindow,
        cancel: &CancellationToken,
    ) -> Result<PipelineHandle> {
        let descriptors = select_segments(self.store.as_ref(), prefix, window)
            .await
            .context("💀 Segment selection failed, the pipeline was not started")?;
        let total = descriptors.len();
        let token = cancel.child_token();

        let (handoff_tx, handoff_rx) = async_channel::bounded(self.runtime.handoff_capacity());
        let (output_tx, output_rx) = async_channel::bounded(self.runtime.output_capacity());

        let actor = ReorderActor::new(
            ReorderBuffer::new(total, self.gate),
            handoff_rx,
            output_tx,
            token.clone(),
            self.runtime.gap_policy,
            ProgressMetrics::new(prefix.to_string(), total as u64, self.runtime.show_progress),
        )
        .start();

        let fetcher = BoundedFetcher::new(
            Arc::clone(&self.store),
            Spooler::new(self.runtime.spool.clone()),
            self.runtime.parallelism,
        )
        .start(descriptors, handoff_tx, token.clone());

        info!(
            "🧵 pipeline started: {} segment(s), parallelism {}, admission threshold {}, gap policy {:?}",
            total,
            self.runtime.parallelism,
            self.gate.threshold(),
            self.runtime.gap_policy
        );

        let supervisor = tokio::spawn(supervise(total, fetcher, actor, self.runtime.gap_policy));
        Ok(PipelineHandle {
            segments: output_rx,
            supervisor,
            cancel: token,
            total,
        })
    }
}

async fn supervise(
    total: usize,
    fetcher: JoinHandle<FetchStats>,
    actor: JoinHandle<ReorderStats>,
    gap_policy: GapPolicy,
) -> Result<PipelineReport> {
    let fetch_stats = fetcher.await.context("💀 The fetch pool task died")?;
    let reorder_stats = actor.await.context("💀 The reorder buffer task died")?;
    let report = PipelineReport::new(total, &fetch_stats, &reorder_stats);

    if reorder_stats.consumer_disconnected {
        info!(
            "📪 consumer stopped reading after {} of {} segment(s)",
            report.emitted, report.total
        );
    } else if report.cancelled {
        info!(
            "🛑 pipeline cancelled after emitting {} of {} segment(s)",
            report.emitted, report.total
        );
    } else if !report.missing_indices.is_empty() {
        if gap_policy == GapPolicy::Fail {
            bail!(
                "💀 {} of {} segment(s) could not be fetched (indices {:?}); {} emitted before the first gap",
                report.missing_indices.len(),
                report.total,
                report.missing_indices,
                report.emitted
            );
        }
        warn!(
            "🕳️ pipeline finished with {} missing segment(s) (indices {:?}), {} of {} emitted",
            report.missing_indices.len(),
            report.missing_indices,
            report.emitted,
            report.total
        );
    } else {
        info!("✅ pipeline finished: {} of {} segment(s) emitted", report.emitted, report.total);
    }
    Ok(report)
}

/// 📬 The consumer's end of a running pipeline.
///
/// Read with [`recv`](Self::recv) until it returns `None` (clean end of
/// sequence), then [`join`](Self::join) for the report or the error.
#[derive(Debug)]
pub struct PipelineHandle {
    segments: Receiver<IndexedPayload>,
    supervisor: JoinHandle<Result<PipelineReport>>,
    cancel: CancellationToken,
    total: usize,
}

impl PipelineHandle {
    /// 📦 Segments selected for this run.
    pub fn total(&self) -> usize {
        self.total
    }

    /// 📥 Next segment in index order, `None` once the sequence is closed.
    pub async fn recv(&self) -> Option<IndexedPayload> {
        self.segments.recv().await.ok()
    }

    /// 🛑 Stop starting fetches, abandon in-flight ones, release what is buffered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 🏁 Wait for the run to wind down. Unread segments are released.
    pub async fn join(self) -> Result<PipelineReport> {
        let Self {
            segments,
            supervisor,
            ..
        } = self;
        drop(segments);
        supervisor.await.context("💀 The pipeline supervisor task died")?
    }
}
