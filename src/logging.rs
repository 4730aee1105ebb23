//! Logging setup.
//!
//! Logs go to stdout, or to a per-run file under
//! `<parent>/results/<YYYY-MM-DD>/<uuid>/snapshot_change.log`.

use crate::config::LogTarget;
use crate::error::{Result, ShipError};
use chrono::{Local, NaiveDate};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub const LOG_FILE_NAME: &str = "snapshot_change.log";

/// Location of the log file for one run.
pub fn run_log_path(parent: &Path, date: NaiveDate, run_id: &Uuid) -> PathBuf {
    parent
        .join("results")
        .join(date.format("%Y-%m-%d").to_string())
        .join(run_id.to_string())
        .join(LOG_FILE_NAME)
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("snapship=debug,warn")
        } else {
            EnvFilter::new("snapship=info,warn")
        }
    })
}

/// Install the global subscriber. Returns the log file path when logging
/// to a run directory.
pub fn init(target: &LogTarget, verbose: bool) -> Result<Option<PathBuf>> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_target(false)
        .with_thread_ids(false);

    match target {
        LogTarget::Stdout => {
            builder
                .with_writer(std::io::stdout)
                .try_init()
                .map_err(|e| ShipError::Config(format!("Cannot install logger: {}", e)))?;
            Ok(None)
        }
        LogTarget::RunDir { parent } => {
            let path = run_log_path(parent, Local::now().date_naive(), &Uuid::new_v4());
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;

            builder
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .try_init()
                .map_err(|e| ShipError::Config(format!("Cannot install logger: {}", e)))?;
            Ok(Some(path))
        }
    }
}
