//! 🎬 *[five downloads finish. in the order 3, 0, 4, 1, 2.]*
//! *[the consumer taps its foot. it asked for 0 first. it always asks for 0 first.]*
//!
//! 🔀 The Reorder/Admission Buffer: out-of-order completions in, strict index order out.
//!
//! One actor owns one [`ReorderBuffer`]. Every arrival from the hand-off queue is
//! inserted (sorted by index, no duplicates), `completed` ticks up, and then:
//!
//! 1. 🚪 the admission gate must be open: `completed / total >= threshold`
//! 2. 🎯 the front of the buffer must be `next_expected`
//! 3. 📏 the longest run of consecutive indices from the front is flushed, in order
//!
//! When the hand-off queue closes, the [`GapPolicy`] decides what happens to
//! whatever is still waiting for an index that will never arrive.
//!
//! 🧠 Knowledge graph:
//! - `ReorderBuffer`: pure, synchronous, no channels. All the interesting logic.
//! - `ReorderActor`: the async loop around it. The ONLY thing that ever touches the buffer.
//! - Buffer size stays small by construction: workers block on a `3P` hand-off queue.
//!
//! 🦆 The duck tried to cut in line. The duck was given index 7 and told to wait.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use async_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::IndexedPayload;
use crate::progress::ProgressMetrics;

/// 🚪 Default admission threshold: flush once a quarter of the work is done.
pub const DEFAULT_ADMISSION_THRESHOLD: f64 = 0.25;
/// 🧱 Thresholds at or above this are replaced by the default.
pub const MAX_ADMISSION_THRESHOLD: f64 = 0.5;

// ============================================================
//  🚪 AdmissionGate
// ============================================================

/// 🚪 Decides whether enough of the total work has completed to try flushing.
///
/// Each flush attempt is a scan of the buffer front. Early on, when the buffer
/// is a handful of scattered indices, that scan almost never finds anything, so
/// the gate keeps it closed until the odds improve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionGate {
    threshold: f64,
}

impl AdmissionGate {
    /// 🔧 Validate a configured threshold.
    ///
    /// - `NaN` or `<= 0.0` → error, there is no sensible reading of that
    /// - `>= 0.5` → falls back to [`DEFAULT_ADMISSION_THRESHOLD`]
    pub fn new(configured: f64) -> Result<Self> {
        if configured.is_nan() || configured <= 0.0 {
            bail!(
                "💀 admission_threshold must be a fraction in (0, {}), got {}",
                MAX_ADMISSION_THRESHOLD,
                configured
            );
        }
        if configured >= MAX_ADMISSION_THRESHOLD {
            warn!(
                "⚠️ admission_threshold {} is at or above {}, using the default {} instead",
                configured, MAX_ADMISSION_THRESHOLD, DEFAULT_ADMISSION_THRESHOLD
            );
            return Ok(Self {
                threshold: DEFAULT_ADMISSION_THRESHOLD,
            });
        }
        Ok(Self {
            threshold: configured,
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_open(&self, completed: usize, total: usize) -> bool {
        total > 0 && (completed as f64 / total as f64) >= self.threshold
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ADMISSION_THRESHOLD,
        }
    }
}

// ============================================================
//  📊 ProgressCounters / GapPolicy / Admission
// ============================================================

/// 📊 Fetch progress and the emission cursor. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressCounters {
    /// ✅ Payloads admitted so far
    pub completed: usize,
    /// 📦 Payloads the selection promised
    pub total: usize,
    /// 🎯 Smallest index not yet emitted
    pub next_expected: usize,
}

/// 🕳️ What to do with buffered payloads stuck behind a gap once input is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// ✂️ Release whatever has not already been flushed. A run at the cursor still
    /// goes out, but only if the gate is open at the final `completed`.
    #[default]
    Truncate,
    /// 🌊 Flush everything left, in index order, gaps and all
    FlushRemaining,
    /// 💀 Like `Truncate`, but the pipeline reports failure if anything is missing
    Fail,
}

/// 📬 Result of admitting one payload.
#[derive(Debug)]
pub enum Admission {
    /// 🚀 These payloads are ready, in order. Emit them.
    Flush(Vec<IndexedPayload>),
    /// ⏳ Stored. Nothing is flushable yet.
    Held,
    /// 🙅 Duplicate, already emitted, or out of range. Handed back untouched.
    Rejected(IndexedPayload),
}

/// 🏁 What the terminal pass produced.
#[derive(Debug, Default)]
pub struct TerminalDrain {
    /// 🚀 Still emitted, in order
    pub flushed: Vec<IndexedPayload>,
    /// 🗑️ Never emitted. Caller releases them.
    pub stranded: Vec<IndexedPayload>,
}

// ============================================================
//  🔀 ReorderBuffer
// ============================================================

/// 🔀 Index-sorted buffer of completed-but-not-yet-emitted payloads.
///
/// A `BTreeMap` keyed by index gives sorted order and duplicate detection for
/// free, and `pop_first` makes flushing the front cheap.
#[derive(Debug)]
pub struct ReorderBuffer {
    pending: BTreeMap<usize, IndexedPayload>,
    counters: ProgressCounters,
    gate: AdmissionGate,
}

impl ReorderBuffer {
    pub fn new(total: usize, gate: AdmissionGate) -> Self {
        Self {
            pending: BTreeMap::new(),
            counters: ProgressCounters {
                completed: 0,
                total,
                next_expected: 0,
            },
            gate,
        }
    }

    pub fn counters(&self) -> ProgressCounters {
        self.counters
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// 🔢 Buffered indices, ascending.
    pub fn buffered_indices(&self) -> Vec<usize> {
        self.pending.keys().copied().collect()
    }

    /// 📥 Insert one payload and flush whatever became flushable.
    pub fn admit(&mut self, payload: IndexedPayload) -> Admission {
        let index = payload.index;
        if index < self.counters.next_expected
            || index >= self.counters.total
            || self.pending.contains_key(&index)
        {
            return Admission::Rejected(payload);
        }

        self.pending.insert(index, payload);
        self.counters.completed += 1;

        if !self.gate.is_open(self.counters.completed, self.counters.total) {
            return Admission::Held;
        }

        match self.flushable_run() {
            Some(run_length) => Admission::Flush(self.pop_front(run_length + 1)),
            None => Admission::Held,
        }
    }

    /// 📏 If the front is `next_expected`, how many consecutive indices follow it.
    ///
    /// `[0, 1, 5]` with cursor 0 → `Some(1)`. `[0]` → `Some(0)`. `[5]` → `None`.
    /// Ignores the gate on purpose; `admit` checks that first.
    pub fn flushable_run(&self) -> Option<usize> {
        let mut indices = self.pending.keys();
        let first = *indices.next()?;
        if first != self.counters.next_expected {
            return None;
        }

        let mut previous = first;
        let mut run_length = 0;
        for &index in indices {
            if index != previous + 1 {
                break;
            }
            previous = index;
            run_length += 1;
        }
        Some(run_length)
    }

    /// 🏁 Input is exhausted. Apply the gap policy to what is left.
    ///
    /// `Truncate` and `Fail` still respect the gate: if too little of the total
    /// ever completed, even a run sitting at the cursor is released unemitted.
    pub fn finish(&mut self, policy: GapPolicy) -> TerminalDrain {
        let gate_open = self.gate.is_open(self.counters.completed, self.counters.total);
        let flushed = match policy {
            GapPolicy::FlushRemaining => self.pop_front(self.pending.len()),
            GapPolicy::Truncate | GapPolicy::Fail if gate_open => match self.flushable_run() {
                Some(run_length) => self.pop_front(run_length + 1),
                None => Vec::new(),
            },
            GapPolicy::Truncate | GapPolicy::Fail => Vec::new(),
        };
        TerminalDrain {
            flushed,
            stranded: self.drain_all(),
        }
    }

    /// 🗑️ Take everything out without emitting anything.
    pub fn drain_all(&mut self) -> Vec<IndexedPayload> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    fn pop_front(&mut self, count: usize) -> Vec<IndexedPayload> {
        let mut flushed = Vec::with_capacity(count);
        for _ in 0..count {
            let Some((index, payload)) = self.pending.pop_first() else {
                break;
            };
            self.counters.next_expected = index + 1;
            flushed.push(payload);
        }
        flushed
    }
}

// ============================================================
//  🎭 ReorderActor
// ============================================================

/// 📊 What the actor did with its life.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ReorderStats {
    pub emitted: usize,
    /// 🗑️ Received but released without emission, ascending
    pub stranded_indices: Vec<usize>,
    pub rejected: usize,
    pub cancelled: bool,
    pub consumer_disconnected: bool,
}

enum EmitOutcome {
    Sent,
    Cancelled,
    ConsumerGone,
}

/// 🎭 The single owner of the reorder buffer.
///
/// Reads the hand-off queue until it closes, emits flushed runs to the output
/// channel, and drops the output sender on the way out, which is the one and
/// only close of the output sequence. After cancellation (or after the consumer
/// hangs up) it keeps draining the hand-off queue, releasing everything, so that
/// no worker is left blocked on a full queue.
pub(crate) struct ReorderActor {
    buffer: ReorderBuffer,
    inbound: Receiver<IndexedPayload>,
    outbound: Sender<IndexedPayload>,
    cancel: CancellationToken,
    gap_policy: GapPolicy,
    progress: ProgressMetrics,
}

impl ReorderActor {
    pub(crate) fn new(
        buffer: ReorderBuffer,
        inbound: Receiver<IndexedPayload>,
        outbound: Sender<IndexedPayload>,
        cancel: CancellationToken,
        gap_policy: GapPolicy,
        progress: ProgressMetrics,
    ) -> Self {
        Self {
            buffer,
            inbound,
            outbound,
            cancel,
            gap_policy,
            progress,
        }
    }

    pub(crate) fn start(self) -> JoinHandle<ReorderStats> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> ReorderStats {
        let mut stats = ReorderStats::default();
        let mut discarding = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !discarding => {
                    info!("🛑 reorder buffer: cancelled, releasing everything from here on");
                    stats.cancelled = true;
                    discarding = true;
                    continue;
                }
                next = self.inbound.recv() => next,
            };
            // -- Err = closed and empty: every worker has finished
            let Ok(payload) = next else {
                break;
            };

            if discarding {
                stats.stranded_indices.push(payload.index);
                payload.release();
                continue;
            }

            match self.buffer.admit(payload) {
                Admission::Held => {}
                Admission::Rejected(payload) => {
                    warn!(
                        "🙅 reorder buffer rejected index {} ('{}'): duplicate or out of range",
                        payload.index, payload.descriptor.key
                    );
                    stats.rejected += 1;
                    payload.release();
                }
                Admission::Flush(run) => {
                    debug!(
                        "🚀 flushing {} segment(s) starting at index {}",
                        run.len(),
                        run.first().map(|p| p.index).unwrap_or_default()
                    );
                    if !self.emit(run, &mut stats).await {
                        discarding = true;
                    }
                }
            }
        }

        self.terminal_drain(discarding, &mut stats).await;
        self.progress.finish();
        stats.stranded_indices.sort_unstable();
        stats
    }

    async fn terminal_drain(&mut self, discarding: bool, stats: &mut ReorderStats) {
        let TerminalDrain { flushed, stranded } = if discarding {
            TerminalDrain {
                flushed: Vec::new(),
                stranded: self.buffer.drain_all(),
            }
        } else {
            self.buffer.finish(self.gap_policy)
        };

        if !flushed.is_empty() {
            debug!("🏁 terminal flush of {} segment(s)", flushed.len());
            self.emit(flushed, stats).await;
        }

        if stranded.is_empty() {
            info!(
                "🏁 reorder buffer drained: {} emitted, {} rejected, nothing left behind",
                stats.emitted, stats.rejected
            );
        } else {
            let indices: Vec<usize> = stranded.iter().map(|p| p.index).collect();
            warn!(
                "🕳️ reorder buffer drained: {} emitted, {} released without emission (indices {:?}) because index {} never arrived",
                stats.emitted,
                indices.len(),
                indices,
                self.buffer.counters().next_expected
            );
            stats.stranded_indices.extend(indices);
            stranded.into_iter().for_each(IndexedPayload::release);
        }
    }

    /// 📤 Send a run downstream in order. Returns false once nothing more should be sent.
    async fn emit(&mut self, run: Vec<IndexedPayload>, stats: &mut ReorderStats) -> bool {
        let mut run = run.into_iter();
        while let Some(payload) = run.next() {
            let index = payload.index;
            let bytes = payload.content.len();
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => EmitOutcome::Cancelled,
                sent = self.outbound.send(payload) => match sent {
                    Ok(()) => EmitOutcome::Sent,
                    Err(async_channel::SendError(unsent)) => {
                        unsent.release();
                        EmitOutcome::ConsumerGone
                    }
                },
            };

            match outcome {
                EmitOutcome::Sent => {
                    stats.emitted += 1;
                    self.progress.update(bytes, 1);
                }
                EmitOutcome::Cancelled => {
                    // -- the payload went down with the dropped send future
                    info!("🛑 reorder buffer: cancelled mid-flush at index {}", index);
                    stats.cancelled = true;
                    stats.stranded_indices.push(index);
                    self.strand_rest(run, stats);
                    return false;
                }
                EmitOutcome::ConsumerGone => {
                    warn!(
                        "📪 consumer hung up at index {}, stopping the fetch pool",
                        index
                    );
                    stats.consumer_disconnected = true;
                    stats.stranded_indices.push(index);
                    self.cancel.cancel();
                    self.strand_rest(run, stats);
                    return false;
                }
            }
        }
        true
    }

    fn strand_rest(
        &self,
        rest: impl Iterator<Item = IndexedPayload>,
        stats: &mut ReorderStats,
    ) {
        for payload in rest {
            stats.stranded_indices.push(payload.index);
            payload.release();
        }
    }
}
