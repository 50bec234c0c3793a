//! 💾 Segment content: where fetched bytes live between download and flush.
//!
//! A segment's body is either kept in RAM or spooled to a named temp file,
//! depending on [`SpoolConfig`]. Either way the handle is owned by exactly one
//! [`IndexedPayload`](crate::common::IndexedPayload) at a time, and dropping it
//! frees the bytes. For the spooled flavour that means the temp file is unlinked,
//! so there is no cleanup pass to forget. Like a hotel room that checks itself out.
//!
//! 🧠 Knowledge graph:
//! - `Spooler::hold()` is called by fetch workers right after the download.
//! - `SegmentContent::read_all()` is called by the parser stage.
//! - `SegmentContent::release()` is the explicit, logged version of `drop`.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::common::ObjectDescriptor;

// ============================================================
//  🔧 SpoolConfig
// ============================================================

/// 🔧 Where (and whether) fetched segments are spooled to disk.
///
/// Config lives next to the thing it configures. Same ethos as the store configs.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SpoolConfig {
    /// 💾 Spool to a temp file (true) or keep the body in memory (false)
    #[serde(default = "default_spool_enabled")]
    pub enabled: bool,
    /// 📁 Spool directory. `None` means `std::env::temp_dir()`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_spool_enabled() -> bool {
    true
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            enabled: default_spool_enabled(),
            dir: None,
        }
    }
}

// ============================================================
//  📦 SegmentContent
// ============================================================

/// 📦 Owned handle to a fetched body.
#[derive(Debug)]
pub enum SegmentContent {
    /// 🧠 The whole body, in RAM
    Memory(Vec<u8>),
    /// 💾 The whole body, in a temp file that is deleted when this value drops
    Spooled { file: NamedTempFile, len: u64 },
}

impl SegmentContent {
    /// 📏 Size of the body in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(bytes) => bytes.len() as u64,
            Self::Spooled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 📁 Path of the spooled file, if there is one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Memory(_) => None,
            Self::Spooled { file, .. } => Some(file.path()),
        }
    }

    /// 📖 Read the full body back. In-memory bodies are borrowed, not copied.
    pub async fn read_all(&self) -> Result<Cow<'_, [u8]>> {
        match self {
            Self::Memory(bytes) => Ok(Cow::Borrowed(bytes.as_slice())),
            Self::Spooled { file, .. } => tokio::fs::read(file.path())
                .await
                .map(Cow::Owned)
                .with_context(|| {
                    format!(
                        "💀 Spooled segment '{}' could not be read back. It was right here a second ago.",
                        file.path().display()
                    )
                }),
        }
    }

    /// 🗑️ Free the content, with a debug breadcrumb naming whose bytes just left.
    pub fn release(self, key: &str) {
        match self {
            Self::Memory(bytes) => {
                debug!("🗑️ released {} in-memory bytes of '{}'", bytes.len(), key);
            }
            Self::Spooled { file, .. } => {
                let path = file.path().to_path_buf();
                // -- close() unlinks and reports; a failed unlink is worth a log, not a crash
                match file.close() {
                    Ok(()) => debug!("🗑️ file cleaned: '{}' ({})", path.display(), key),
                    Err(err) => debug!(
                        "⚠️ spool file '{}' refused to leave quietly: {}",
                        path.display(),
                        err
                    ),
                }
            }
        }
    }
}

// ============================================================
//  💾 Spooler
// ============================================================

/// 💾 Turns downloaded bytes into a [`SegmentContent`] according to [`SpoolConfig`].
#[derive(Debug, Clone)]
pub(crate) struct Spooler {
    config: SpoolConfig,
}

impl Spooler {
    pub(crate) fn new(config: SpoolConfig) -> Self {
        Self { config }
    }

    fn spool_dir(&self) -> PathBuf {
        self.config.dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// 📥 Take ownership of a downloaded body.
    ///
    /// Spooled files are named `<object file name>_<random>` so a stray one in
    /// `/var/tmp` can still be traced back to the segment it came from.
    pub(crate) async fn hold(
        &self,
        descriptor: &ObjectDescriptor,
        bytes: Vec<u8>,
    ) -> Result<SegmentContent> {
        if !self.config.enabled {
            return Ok(SegmentContent::Memory(bytes));
        }

        let dir = self.spool_dir();
        let file = tempfile::Builder::new()
            .prefix(&format!("{}_", descriptor.file_name()))
            .tempfile_in(&dir)
            .with_context(|| {
                format!(
                    "💀 Could not create a spool file in '{}' for '{}'. Disk full? Permissions? Gremlins?",
                    dir.display(),
                    descriptor.key
                )
            })?;

        let std_handle = file
            .as_file()
            .try_clone()
            .context("💀 Could not clone the spool file handle")?;
        let mut handle = tokio::fs::File::from_std(std_handle);
        handle.write_all(&bytes).await.with_context(|| {
            format!(
                "💀 Writing {} bytes of '{}' to '{}' failed",
                bytes.len(),
                descriptor.key,
                file.path().display()
            )
        })?;
        handle
            .flush()
            .await
            .context("💀 Flushing the spool file failed")?;

        Ok(SegmentContent::Spooled {
            file,
            len: bytes.len() as u64,
        })
    }
}
