//! 🚀 seglift-cli: load config, wire ctrl-c to cancellation, stream lines to stdout.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! The library does the work. This binary parses flags, sets up logging, and
//! gets out of the way. Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufWriter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 🪣 Fetch RDS log segments from S3 in parallel and print their lines in order.
#[derive(Debug, Parser)]
#[command(name = "seglift", version, about)]
struct Args {
    /// 🔧 TOML config file (defaults to ./seglift.toml when it exists)
    config: Option<PathBuf>,

    /// ⏱️ Window start, Unix epoch seconds
    #[arg(long)]
    start: Option<i64>,

    /// ⏱️ Window end, Unix epoch seconds (inclusive)
    #[arg(long)]
    finish: Option<i64>,

    /// 📁 Object key prefix to list
    #[arg(long)]
    prefix: Option<String>,

    /// 📋 Print the run report as JSON on stderr when done
    #[arg(long)]
    report: bool,
}

const DEFAULT_CONFIG_FILE: &str = "seglift.toml";

fn resolve_config_path(explicit: Option<PathBuf>) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) => {
            let exists = path.try_exists().with_context(|| {
                format!(
                    "💀 Couldn't check whether '{}' exists. If it's a relative path, try an absolute one.",
                    path.display()
                )
            })?;
            anyhow::ensure!(
                exists,
                "💀 Configuration file '{}' does not exist",
                path.display()
            );
            Ok(Some(path))
        }
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
            Ok(fallback.try_exists().unwrap_or(false).then_some(fallback))
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config_path = resolve_config_path(args.config)?;
    let mut app_config = seglift::app_config::load_config(config_path.as_deref())
        .context("💀 Couldn't load the config. Check the file and the SEGLIFT_* env vars.")?;

    if let Some(start) = args.start {
        app_config.selection.start = Some(start);
    }
    if let Some(finish) = args.finish {
        app_config.selection.finish = Some(finish);
    }
    if let Some(prefix) = args.prefix {
        app_config.selection.prefix = prefix;
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("🛑 ctrl-c received, winding down");
                on_signal.cancel();
            }
            Err(err) => warn!("⚠️ could not listen for ctrl-c: {}", err),
        }
    });

    let stdout = BufWriter::new(tokio::io::stdout());
    let report = seglift::run(app_config, cancel, stdout).await?;

    if args.report {
        let json = serde_json::to_string_pretty(&report).context("💀 Couldn't serialize the report")?;
        eprintln!("{}", json);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Args::parse()).await {
        error!("💀 error: {}", err);
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
        }
        std::process::exit(1);
    }
}
