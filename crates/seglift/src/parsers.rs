//! 🧾 Parsers: turn ordered segments into ordered items.
//!
//! The pipeline hands out whole segments. Most consumers want the lines inside
//! them. [`stream_items`] sits on the far side of a [`PipelineHandle`], feeds
//! every segment through a [`SegmentParser`] in order, forwards the items to one
//! channel, and releases each segment once it has been parsed.
//!
//! Parse errors are logged at debug and skipped. The consumer sees items and a
//! clean close, nothing else, the same contract the segment channel has.

use std::io::Read;

use anyhow::{Context, Result};
use async_channel::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::common::IndexedPayload;
use crate::pipeline::{PipelineHandle, PipelineReport};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// 🧾 Bytes of one segment in, items out.
///
/// Errors are per item: one bad line does not sink the rest of the segment.
pub trait SegmentParser: Send + Sync + 'static {
    type Item: Send + 'static;

    fn parse(&self, segment: &IndexedPayload, bytes: &[u8]) -> Vec<Result<Self::Item>>;
}

/// 📜 One line of a log segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub segment_index: usize,
    /// 🔢 1-based, counting skipped empty lines too
    pub line_number: usize,
    pub text: String,
}

/// 📜 Newline-delimited text. Strips `\r`, skips empty lines, inflates gzip bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineParser;

impl SegmentParser for LineParser {
    type Item = LogLine;

    fn parse(&self, segment: &IndexedPayload, bytes: &[u8]) -> Vec<Result<LogLine>> {
        let inflated;
        let body: &[u8] = if bytes.starts_with(&GZIP_MAGIC) {
            match inflate(bytes) {
                Ok(decompressed) => {
                    inflated = decompressed;
                    &inflated
                }
                Err(err) => {
                    return vec![Err(err.context(format!(
                        "💀 '{}' looks gzipped but would not inflate",
                        segment.descriptor.key
                    )))];
                }
            }
        } else {
            bytes
        };

        let mut items = Vec::new();
        let mut start = 0;
        let mut line_number = 0;
        for end in memchr::memchr_iter(b'\n', body).chain(std::iter::once(body.len())) {
            let raw = &body[start..end];
            start = end + 1;
            line_number += 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }
            items.push(
                std::str::from_utf8(raw)
                    .map(|text| LogLine {
                        segment_index: segment.index,
                        line_number,
                        text: text.to_owned(),
                    })
                    .with_context(|| {
                        format!(
                            "💀 line {} of '{}' is not valid UTF-8",
                            line_number, segment.descriptor.key
                        )
                    }),
            );
        }
        items
    }
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decompressed = Vec::with_capacity(bytes.len() * 4);
    flate2::read::MultiGzDecoder::new(bytes)
        .read_to_end(&mut decompressed)
        .context("💀 gzip stream is corrupt")?;
    Ok(decompressed)
}

/// 🌊 Parse every segment of a running pipeline, in order, into one item channel.
///
/// The join handle resolves to the pipeline's report once the last segment has
/// been parsed. Dropping the item receiver cancels the pipeline.
pub fn stream_items<P>(
    handle: PipelineHandle,
    parser: P,
    capacity: usize,
) -> (Receiver<P::Item>, JoinHandle<Result<PipelineReport>>)
where
    P: SegmentParser,
{
    let (tx, rx) = async_channel::bounded(capacity.max(1));

    let task = tokio::spawn(async move {
        while let Some(segment) = handle.recv().await {
            let parsed = segment
                .content
                .read_all()
                .await
                .map(|bytes| parser.parse(&segment, &bytes));
            let items = match parsed {
                Ok(items) => items,
                Err(err) => {
                    warn!(
                        "💀 could not read back '{}' (index {}), skipping it: {:#}",
                        segment.descriptor.key, segment.index, err
                    );
                    segment.release();
                    continue;
                }
            };

            let mut parse_errors = 0usize;
            for item in items {
                match item {
                    Ok(item) => {
                        if tx.send(item).await.is_err() {
                            debug!("📪 item consumer hung up, cancelling the pipeline");
                            segment.release();
                            handle.cancel();
                            return handle.join().await;
                        }
                    }
                    Err(err) => {
                        parse_errors += 1;
                        debug!("🤷 skipping unparseable item: {:#}", err);
                    }
                }
            }
            if parse_errors > 0 {
                debug!(
                    "🤷 '{}' had {} unparseable item(s)",
                    segment.descriptor.key, parse_errors
                );
            }
            segment.release();
        }

        drop(tx);
        handle.join().await
    });

    (rx, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::RuntimeConfig;
    use crate::common::ObjectDescriptor;
    use crate::content::{SegmentContent, SpoolConfig};
    use crate::pipeline::Pipeline;
    use crate::selector::TimeWindow;
    use crate::stores::{InMemoryStore, StoreBackend};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tokio_util::sync::CancellationToken;

    fn segment(bytes: &[u8]) -> IndexedPayload {
        IndexedPayload::new(
            ObjectDescriptor::new("pid/rds_log_a_1698228000", 1698228000, 3),
            SegmentContent::Memory(bytes.to_vec()),
        )
    }

    fn texts(items: Vec<Result<LogLine>>) -> Vec<String> {
        items
            .into_iter()
            .map(|item| item.expect("💀 every line should parse").text)
            .collect()
    }

    #[test]
    fn the_one_where_crlf_and_blank_lines_are_tidied_away() {
        let body = b"select 1;\r\nselect 2;\n\n\nselect 3;";
        let items = LineParser.parse(&segment(body), body);

        let numbers: Vec<usize> = items
            .iter()
            .map(|item| item.as_ref().map(|line| line.line_number).unwrap_or(0))
            .collect();
        assert_eq!(numbers, vec![1, 2, 5]);
        assert!(items.iter().all(|item| item.as_ref().is_ok_and(|l| l.segment_index == 3)));
        assert_eq!(texts(items), vec!["select 1;", "select 2;", "select 3;"]);
    }

    #[test]
    fn the_one_where_a_trailing_newline_adds_nothing() {
        let body = b"one\ntwo\n";
        assert_eq!(texts(LineParser.parse(&segment(body), body)), vec!["one", "two"]);
        assert!(LineParser.parse(&segment(b""), b"").is_empty());
    }

    #[test]
    fn the_one_where_gzip_is_inflated_on_the_fly() -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"2023-10-25 LOG: hello\n2023-10-25 LOG: world\n")?;
        let compressed = encoder.finish()?;

        let items = LineParser.parse(&segment(&compressed), &compressed);
        assert_eq!(texts(items), vec!["2023-10-25 LOG: hello", "2023-10-25 LOG: world"]);
        Ok(())
    }

    #[test]
    fn the_one_where_bad_utf8_is_one_bad_line_not_a_bad_segment() {
        let body = b"fine\n\xff\xfe\nalso fine\n";
        let items = LineParser.parse(&segment(body), body);
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
        assert!(items[2].is_ok());
    }

    #[tokio::test]
    async fn the_one_where_lines_stream_out_in_segment_order() -> Result<()> {
        let base = 1698228000;
        let store = (0..4).fold(InMemoryStore::new(), |store, i| {
            store.with_object(
                format!("pid/rds_log_abc_{}", base + i),
                format!("segment {} line 1\nsegment {} line 2\n", i, i),
            )
        });
        let store = store.with_object(format!("pid/rds_log_abc_{}", base + 4), b"\xff\n".to_vec());
        let runtime = RuntimeConfig {
            parallelism: 3,
            spool: SpoolConfig {
                enabled: false,
                dir: None,
            },
            ..RuntimeConfig::default()
        };

        let pipeline = Pipeline::new(StoreBackend::InMemory(store), &runtime)?;
        let handle = pipeline
            .start("pid/", TimeWindow::new(base, base + 4), &CancellationToken::new())
            .await?;
        let (lines, task) = stream_items(handle, LineParser, 4);

        let mut seen = Vec::new();
        while let Ok(line) = lines.recv().await {
            seen.push(line.text);
        }
        let report = task.await??;

        let expected: Vec<String> = (0..4)
            .flat_map(|i| [format!("segment {} line 1", i), format!("segment {} line 2", i)])
            .collect();
        assert_eq!(seen, expected);
        assert_eq!(report.emitted, 5);
        Ok(())
    }
}
