//! 🔧 App configuration: TOML and `SEGLIFT_*` env vars in, one validated struct out.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the
//! fridge. In `/var/tmp`. Nothing." 🦆
//!
//! ```toml
//! [store.S3]
//! bucket = "rds-logs"
//! region = "sa-east-1"
//!
//! [selection]
//! prefix = "db-prod/"
//! start = 1698228000
//! finish = 1698238800
//!
//! [runtime]
//! parallelism = 5
//! admission_threshold = 0.25
//! gap_policy = "truncate"
//! ```
//!
//! Env vars nest with a double underscore: `SEGLIFT_RUNTIME__PARALLELISM=8`.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::content::SpoolConfig;
use crate::reorder::{AdmissionGate, DEFAULT_ADMISSION_THRESHOLD, GapPolicy};
use crate::selector::TimeWindow;
use crate::stores::StoreConfig;

/// 📦 Everything a run needs to know about itself.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 🪣 Where the segments live
    pub store: StoreConfig,
    /// 🔎 Which segments we want
    #[serde(default)]
    pub selection: SelectionConfig,
    /// ⚙️ How hard to pull
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🔎 Prefix plus the inclusive time window, both ends in Unix epoch seconds.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct SelectionConfig {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub finish: Option<i64>,
}

impl SelectionConfig {
    /// 🪟 Both ends are required. Their order is not.
    pub fn window(&self) -> Result<TimeWindow> {
        let start = self
            .start
            .ok_or_else(|| anyhow!("💀 selection.start is missing. Which second should we start from?"))?;
        let finish = self
            .finish
            .ok_or_else(|| anyhow!("💀 selection.finish is missing. A window needs two ends."))?;
        Ok(TimeWindow::new(start, finish))
    }
}

/// ⚙️ Pool size, admission threshold, gap handling, and where bytes wait.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// 🧵 Concurrent downloads. Hand-off queue is `3x` this, output channel `1x`.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// 🚪 Fraction of completions needed before flushing is attempted
    #[serde(default = "default_admission_threshold")]
    pub admission_threshold: f64,
    #[serde(default)]
    pub gap_policy: GapPolicy,
    #[serde(default)]
    pub show_progress: bool,
    #[serde(default)]
    pub spool: SpoolConfig,
}

fn default_parallelism() -> usize {
    5
}

fn default_admission_threshold() -> f64 {
    DEFAULT_ADMISSION_THRESHOLD
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            admission_threshold: default_admission_threshold(),
            gap_policy: GapPolicy::default(),
            show_progress: false,
            spool: SpoolConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// ✅ Check the knobs and resolve the admission gate.
    pub fn validate(&self) -> Result<AdmissionGate> {
        if self.parallelism == 0 {
            bail!("💀 runtime.parallelism must be at least 1. Zero workers fetch zero segments, slowly.");
        }
        AdmissionGate::new(self.admission_threshold).context("💀 runtime.admission_threshold is invalid")
    }

    pub fn handoff_capacity(&self) -> usize {
        self.parallelism.max(1) * 3
    }

    pub fn output_capacity(&self) -> usize {
        self.parallelism.max(1)
    }
}

/// 🚀 Load the config from `SEGLIFT_*` env vars, plus a TOML file if one is given.
///
/// - `None` → env vars only
/// - `Some(path)` → env vars and the file, merged. The file wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("SEGLIFT_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (SEGLIFT_*). \
             Check the [store], [selection] and [runtime] tables.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (SEGLIFT_*). \
                 No file was provided, so at least SEGLIFT_STORE__... has to be set."
            .to_string(),
    };

    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::StoreConfig;
    use std::io::Write;

    fn write_test_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .prefix("seglift_app_config_")
            .suffix(".toml")
            .tempfile()
            .expect("💀 Failed to create a temp config. The filesystem said 'new phone who dis'.");
        file.write_all(contents.as_bytes())
            .expect("💀 Failed to write the temp config.");
        file
    }

    #[test]
    fn the_one_where_every_table_shows_up() -> Result<()> {
        let file = write_test_config(
            r#"
            [store.S3]
            bucket = "rds-logs"
            region = "us-east-1"
            max_attempts = 20

            [selection]
            prefix = "db-prod/"
            start = 1698238800
            finish = 1698228000

            [runtime]
            parallelism = 8
            admission_threshold = 0.1
            gap_policy = "flush_remaining"
            show_progress = true

            [runtime.spool]
            enabled = false
            "#,
        );

        let app_config = load_config(Some(file.path()))?;

        match &app_config.store {
            StoreConfig::S3(s3) => {
                assert_eq!(s3.bucket, "rds-logs");
                assert_eq!(s3.region, "us-east-1");
                assert_eq!(s3.max_attempts, 20);
            }
            honestly_who_knows => panic!("💀 expected S3, got {:?}", honestly_who_knows),
        }
        assert_eq!(app_config.selection.prefix, "db-prod/");
        let window = app_config.selection.window()?;
        assert_eq!((window.start(), window.finish()), (1698228000, 1698238800));
        assert_eq!(app_config.runtime.parallelism, 8);
        assert_eq!(app_config.runtime.gap_policy, GapPolicy::FlushRemaining);
        assert!(app_config.runtime.show_progress);
        assert!(!app_config.runtime.spool.enabled);
        assert_eq!(app_config.runtime.handoff_capacity(), 24);
        assert_eq!(app_config.runtime.output_capacity(), 8);
        Ok(())
    }

    #[test]
    fn the_one_where_runtime_defaults_show_up_uninvited_but_helpful() -> Result<()> {
        let file = write_test_config(
            r#"
            [store.InMemory]
            [[store.InMemory.objects]]
            key = "pid/rds_log_a_1698228000"
            body = "hello"
            "#,
        );

        let app_config = load_config(Some(file.path()))?;

        assert_eq!(app_config.runtime, RuntimeConfig::default());
        assert_eq!(app_config.runtime.parallelism, 5);
        assert_eq!(app_config.runtime.admission_threshold, 0.25);
        assert_eq!(app_config.runtime.gap_policy, GapPolicy::Truncate);
        assert!(app_config.runtime.spool.enabled);
        assert_eq!(app_config.selection, SelectionConfig::default());
        Ok(())
    }

    #[test]
    fn the_one_where_a_half_open_window_is_refused() {
        let selection = SelectionConfig {
            prefix: "pid/".to_string(),
            start: Some(1),
            finish: None,
        };
        assert!(selection.window().is_err());
    }

    #[test]
    fn the_one_where_validation_guards_the_knobs() -> Result<()> {
        let zero_workers = RuntimeConfig {
            parallelism: 0,
            ..RuntimeConfig::default()
        };
        assert!(zero_workers.validate().is_err());

        let negative = RuntimeConfig {
            admission_threshold: -0.5,
            ..RuntimeConfig::default()
        };
        assert!(negative.validate().is_err());

        let greedy = RuntimeConfig {
            admission_threshold: 0.75,
            ..RuntimeConfig::default()
        };
        assert_eq!(greedy.validate()?.threshold(), 0.25);
        Ok(())
    }

    #[test]
    fn the_one_where_a_typo_in_the_policy_is_caught() {
        let file = write_test_config(
            r#"
            [store.InMemory]

            [runtime]
            gap_policy = "yolo"
            "#,
        );
        assert!(load_config(Some(file.path())).is_err());
    }
}
