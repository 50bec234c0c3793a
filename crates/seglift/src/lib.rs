//! 🪣 seglift: fetch timestamped log segments in parallel, hand them downstream in order.
//!
//! 🎬 *[a prefix full of RDS log segments. five downloads at a time.]*
//! *[they finish in any order they like. the consumer gets them in exactly one.]*
//!
//! ```text
//! selector ─▶ fetcher (P workers) ─▶ reorder buffer (one actor) ─▶ PipelineHandle ─▶ parsers
//! ```
//!
//! - [`selector`]: list a prefix, keep names whose embedded epoch is in the window
//! - [`pipeline`]: the orchestrator and the consumer's handle
//! - [`reorder`]: the admission gate and the reorder buffer
//! - [`parsers`]: segments → lines, still in order
//! - [`stores`]: S3 and an in-memory stand-in behind one trait
//!
//! [`run`] wires all of it to a config and a writer, which is what the CLI does.

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod app_config;
pub mod common;
pub mod content;
pub(crate) mod fetcher;
pub mod parsers;
pub mod pipeline;
pub(crate) mod progress;
pub mod reorder;
pub mod selector;
pub mod stores;

use crate::app_config::AppConfig;
use crate::parsers::{LineParser, stream_items};
use crate::pipeline::{Pipeline, PipelineReport};
use crate::stores::StoreBackend;

/// 🚀 Select, fetch, reorder and parse per `app_config`, writing every line to `writer`.
///
/// Lines go out in segment order, then line order, one per `\n`. Cancelling
/// `cancel` winds the run down; what was already written stays written.
pub async fn run<W>(app_config: AppConfig, cancel: CancellationToken, mut writer: W) -> Result<PipelineReport>
where
    W: AsyncWrite + Unpin,
{
    let window = app_config.selection.window()?;
    let store = StoreBackend::from_config(&app_config.store)
        .await
        .context("💀 Failed to build the object store from config")?;
    let pipeline = Pipeline::new(store, &app_config.runtime)?;
    let handle = pipeline
        .start(&app_config.selection.prefix, window, &cancel)
        .await?;

    info!(
        "🚀 streaming {} segment(s) from '{}'",
        handle.total(),
        app_config.selection.prefix
    );
    let (lines, parser_task) = stream_items(handle, LineParser, app_config.runtime.output_capacity() * 64);

    let mut written = 0u64;
    while let Ok(line) = lines.recv().await {
        writer
            .write_all(line.text.as_bytes())
            .await
            .context("💀 Failed to write a line to the output")?;
        writer
            .write_all(b"\n")
            .await
            .context("💀 Failed to write a line to the output")?;
        written += 1;
    }
    writer.flush().await.context("💀 Failed to flush the output")?;

    let report = parser_task
        .await
        .context("💀 The parser task died")??;
    info!("✅ wrote {} line(s) from {} segment(s)", written, report.emitted);
    Ok(report)
}
