//! Configuration for snapship.
//!
//! Settings come from the command line, optionally layered over a TOML file
//! (`--config`). Command line values win. The result is validated once into
//! a [`ShipConfig`] that is handed to the pipeline; nothing is read from
//! globals afterwards.

use crate::error::{Result, ShipError};
use crate::shipping::archiver::{ArchiveScope, ArchiverConfig, DeliveryMode};
use crate::shipping::batcher::BatcherConfig;
use crate::shipping::channel::{
    OverflowPolicy, DEFAULT_BATCH_SIZE, DEFAULT_RELAY_TIMEOUT, RELAY_CAPACITY,
};
use crate::shipping::detector::DetectorConfig;
use crate::shipping::shipper::{RetryPolicy, ShipperConfig};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File names the detector ships
pub const SNAPSHOT_FILES: &[&str] = &[
    "snapshot.gc",
    "snapshot.meta",
    "snapshot.meta.bkp",
    "snapshot.state",
    "snapshot.state.bkp",
];

/// Reserved watch interval. Not used for poll pacing.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(15);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_DEST: &str = "./bucket1";
pub const DEFAULT_STAGING: &str = "./tmp";
pub const DEFAULT_REGION: &str = "eu-central-1";

/// Watch a snapshot directory and ship changed files in batches
#[derive(Parser, Debug, Clone)]
#[command(name = "snapship", version, about)]
pub struct CliArgs {
    /// Directory to watch for new or modified snapshot files
    pub watch_dir: PathBuf,

    /// Local delivery directory
    #[arg(long, value_name = "DIR")]
    pub dest: Option<PathBuf>,

    /// Where artifacts are staged before delivery
    #[arg(long, value_name = "DIR")]
    pub staging: Option<PathBuf>,

    /// Directory archived with --archive-scope snapshot-root (default: watch dir)
    #[arg(long, value_name = "DIR")]
    pub snapshot_root: Option<PathBuf>,

    /// Seconds between directory polls
    #[arg(long, value_name = "SECS")]
    pub poll_interval: Option<f64>,

    /// Files per batch
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,

    /// Seconds a stage waits for input before failing
    #[arg(long, value_name = "SECS")]
    pub relay_timeout: Option<f64>,

    /// Capacity of each hand-off queue
    #[arg(long, value_name = "N")]
    pub relay_capacity: Option<usize>,

    /// What to do when a hand-off queue is full
    #[arg(long, value_enum)]
    pub overflow: Option<OverflowPolicy>,

    #[arg(long, value_enum)]
    pub mode: Option<DeliveryMode>,

    #[arg(long, value_enum)]
    pub archive_scope: Option<ArchiveScope>,

    /// Delivery target (auto: remote when credentials are given)
    #[arg(long, value_enum)]
    pub sink: Option<SinkChoice>,

    #[arg(long, env = "SNAPSHIP_ACCESS_KEY", hide_env_values = true)]
    pub access_key: Option<String>,

    #[arg(long, env = "SNAPSHIP_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    #[arg(long, env = "SNAPSHIP_BUCKET")]
    pub bucket: Option<String>,

    #[arg(long, env = "SNAPSHIP_REGION")]
    pub region: Option<String>,

    /// Delivery attempts per object
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Pipeline restarts allowed after a fatal task failure
    #[arg(long, value_name = "N")]
    pub max_restarts: Option<u32>,

    /// Archive the snapshot root every SECS seconds instead of watching for changes
    #[arg(long, value_name = "SECS")]
    pub snapshot_interval: Option<f64>,

    /// Ship files already present at startup
    #[arg(long)]
    pub emit_existing: bool,

    /// TOML file with default settings
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write logs to <DIR>/results/<date>/<uuid>/snapshot_change.log
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SinkChoice {
    #[default]
    Auto,
    Local,
    Remote,
}

/// Settings accepted from a `--config` TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub dest: Option<PathBuf>,
    pub staging: Option<PathBuf>,
    pub snapshot_root: Option<PathBuf>,
    pub tracked: Option<Vec<String>>,
    pub poll_interval: Option<f64>,
    pub batch_size: Option<usize>,
    pub relay_timeout: Option<f64>,
    pub relay_capacity: Option<usize>,
    pub overflow: Option<OverflowPolicy>,
    pub mode: Option<DeliveryMode>,
    pub archive_scope: Option<ArchiveScope>,
    pub sink: Option<SinkChoice>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub retries: Option<u32>,
    pub max_restarts: Option<u32>,
    pub snapshot_interval: Option<f64>,
    pub emit_existing: Option<bool>,
    pub log_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShipError::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
            .map_err(|e| ShipError::Config(format!("Invalid config file {}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Credentials and location for an S3 bucket
#[derive(Clone, PartialEq, Eq)]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish()
    }
}

/// Where artifacts end up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkSelection {
    Local { root: PathBuf },
    Remote(S3Credentials),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    /// Per-run log file under `<parent>/results/<date>/<uuid>/`
    RunDir { parent: PathBuf },
}

/// Validated configuration for one process
#[derive(Debug, Clone)]
pub struct ShipConfig {
    pub detector: DetectorConfig,
    pub batcher: BatcherConfig,
    pub archiver: ArchiverConfig,
    pub shipper: ShipperConfig,
    pub relay_capacity: usize,
    pub overflow: OverflowPolicy,
    pub sink: SinkSelection,
    /// Backoff between pipeline restarts; `max_attempts - 1` restarts allowed
    pub restart: RetryPolicy,
    /// Periodic whole-root mode when set
    pub snapshot_interval: Option<Duration>,
    pub log: LogTarget,
    pub verbose: bool,
}

impl ShipConfig {
    /// Merge CLI arguments over the optional config file and validate.
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(&expand_tilde(path))?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    pub fn merge(args: CliArgs, file: FileConfig) -> Result<Self> {
        let watch_dir = expand_tilde(&args.watch_dir);
        if !watch_dir.is_dir() {
            return Err(ShipError::Config(format!(
                "Watch directory does not exist: {}",
                watch_dir.display()
            )));
        }

        let poll_interval = match args.poll_interval.or(file.poll_interval) {
            Some(secs) => seconds("poll interval", secs)?,
            None => DEFAULT_POLL_INTERVAL,
        };
        let relay_timeout = match args.relay_timeout.or(file.relay_timeout) {
            Some(secs) => seconds("relay timeout", secs)?,
            None => DEFAULT_RELAY_TIMEOUT,
        };
        let snapshot_interval = args
            .snapshot_interval
            .or(file.snapshot_interval)
            .map(|secs| seconds("snapshot interval", secs))
            .transpose()?;

        let batch_size = args.batch_size.or(file.batch_size).unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ShipError::Config("Batch size must be at least 1".into()));
        }
        let relay_capacity = args
            .relay_capacity
            .or(file.relay_capacity)
            .unwrap_or(RELAY_CAPACITY);
        if relay_capacity == 0 {
            return Err(ShipError::Config("Relay capacity must be at least 1".into()));
        }

        let tracked = file
            .tracked
            .unwrap_or_else(|| SNAPSHOT_FILES.iter().map(|s| s.to_string()).collect());
        if tracked.is_empty() {
            return Err(ShipError::Config("Tracked file list is empty".into()));
        }

        let dest = path_or(args.dest.or(file.dest), DEFAULT_DEST);
        let staging = path_or(args.staging.or(file.staging), DEFAULT_STAGING);
        let snapshot_root = args
            .snapshot_root
            .or(file.snapshot_root)
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|| watch_dir.clone());

        let sink = select_sink(
            args.sink.or(file.sink).unwrap_or_default(),
            args.access_key.or(file.access_key),
            args.secret_key.or(file.secret_key),
            args.bucket.or(file.bucket),
            args.region.or(file.region),
            dest,
        )?;

        let retry = RetryPolicy {
            max_attempts: args.retries.or(file.retries).unwrap_or(3).max(1),
            ..RetryPolicy::default()
        };
        let restart = RetryPolicy {
            max_attempts: args.max_restarts.or(file.max_restarts).unwrap_or(0) + 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        };

        let log = match args.log_dir.or(file.log_dir) {
            Some(parent) => LogTarget::RunDir {
                parent: expand_tilde(&parent),
            },
            None => LogTarget::Stdout,
        };

        Ok(Self {
            detector: DetectorConfig {
                root: watch_dir,
                tracked,
                poll_interval,
                emit_existing: args.emit_existing || file.emit_existing.unwrap_or(false),
            },
            batcher: BatcherConfig {
                batch_size,
                timeout: relay_timeout,
            },
            archiver: ArchiverConfig {
                mode: args.mode.or(file.mode).unwrap_or_default(),
                scope: args.archive_scope.or(file.archive_scope).unwrap_or_default(),
                snapshot_root,
                staging,
            },
            shipper: ShipperConfig {
                retry,
                timeout: relay_timeout,
            },
            relay_capacity,
            overflow: args.overflow.or(file.overflow).unwrap_or_default(),
            sink,
            restart,
            snapshot_interval,
            log,
            verbose: args.verbose,
        })
    }
}

fn select_sink(
    choice: SinkChoice,
    access_key: Option<String>,
    secret_key: Option<String>,
    bucket: Option<String>,
    region: Option<String>,
    dest: PathBuf,
) -> Result<SinkSelection> {
    let given = [&access_key, &secret_key, &bucket]
        .iter()
        .filter(|v| v.is_some())
        .count();

    let wants_remote = match choice {
        SinkChoice::Local => false,
        SinkChoice::Remote => true,
        SinkChoice::Auto => given > 0,
    };
    if !wants_remote {
        return Ok(SinkSelection::Local { root: dest });
    }

    let missing: Vec<&str> = [
        ("--access-key", access_key.is_none()),
        ("--secret-key", secret_key.is_none()),
        ("--bucket", bucket.is_none()),
    ]
    .into_iter()
    .filter_map(|(flag, absent)| absent.then_some(flag))
    .collect();

    let (Some(access_key), Some(secret_key), Some(bucket)) = (access_key, secret_key, bucket)
    else {
        return Err(ShipError::Config(format!(
            "Remote delivery needs credentials; missing {}",
            missing.join(", ")
        )));
    };

    if !cfg!(feature = "s3") {
        return Err(ShipError::Config(
            "Remote delivery requested but snapship was built without the `s3` feature".into(),
        ));
    }

    Ok(SinkSelection::Remote(S3Credentials {
        access_key,
        secret_key,
        bucket,
        region: region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
    }))
}

fn seconds(what: &str, secs: f64) -> Result<Duration> {
    if secs.is_nan() || secs <= 0.0 {
        return Err(ShipError::Config(format!("{} must be positive, got {}", what, secs)));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ShipError::Config(format!("Invalid {}: {}", what, e)))
}

fn path_or(path: Option<PathBuf>, default: &str) -> PathBuf {
    expand_tilde(&path.unwrap_or_else(|| PathBuf::from(default)))
}

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(watch: &Path, extra: &[&str]) -> CliArgs {
        let mut argv = vec!["snapship".to_string(), watch.display().to_string()];
        argv.extend(extra.iter().map(|s| s.to_string()));
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = ShipConfig::merge(args(tmp.path(), &[]), FileConfig::default()).unwrap();

        assert_eq!(config.detector.root, tmp.path());
        assert_eq!(config.detector.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.detector.tracked.len(), SNAPSHOT_FILES.len());
        assert_eq!(config.batcher.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.batcher.timeout, DEFAULT_RELAY_TIMEOUT);
        assert_eq!(config.archiver.mode, DeliveryMode::Archive);
        assert_eq!(config.archiver.scope, ArchiveScope::Members);
        assert_eq!(config.archiver.snapshot_root, tmp.path());
        assert_eq!(config.overflow, OverflowPolicy::Block);
        assert_eq!(config.restart.max_attempts, 1);
        assert_eq!(
            config.sink,
            SinkSelection::Local {
                root: PathBuf::from(DEFAULT_DEST)
            }
        );
        assert_eq!(config.log, LogTarget::Stdout);
        assert!(config.snapshot_interval.is_none());
    }

    #[test]
    fn test_cli_overrides() {
        let tmp = TempDir::new().unwrap();
        let config = ShipConfig::merge(
            args(
                tmp.path(),
                &[
                    "--poll-interval",
                    "0.25",
                    "--batch-size",
                    "2",
                    "--mode",
                    "individual",
                    "--archive-scope",
                    "snapshot-root",
                    "--overflow",
                    "drop-newest",
                    "--max-restarts",
                    "3",
                ],
            ),
            FileConfig::default(),
        )
        .unwrap();

        assert_eq!(config.detector.poll_interval, Duration::from_millis(250));
        assert_eq!(config.batcher.batch_size, 2);
        assert_eq!(config.archiver.mode, DeliveryMode::Individual);
        assert_eq!(config.archiver.scope, ArchiveScope::SnapshotRoot);
        assert_eq!(config.overflow, OverflowPolicy::DropNewest);
        assert_eq!(config.restart.max_attempts, 4);
    }

    #[test]
    fn test_file_values_under_cli() {
        let tmp = TempDir::new().unwrap();
        let file = FileConfig::parse(
            r#"
            batch_size = 7
            poll_interval = 2.0
            tracked = ["state.json"]
            mode = "individual"
            "#,
        )
        .unwrap();

        let config = ShipConfig::merge(args(tmp.path(), &["--batch-size", "3"]), file).unwrap();
        assert_eq!(config.batcher.batch_size, 3);
        assert_eq!(config.detector.poll_interval, Duration::from_secs(2));
        assert_eq!(config.detector.tracked, vec!["state.json".to_string()]);
        assert_eq!(config.archiver.mode, DeliveryMode::Individual);
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        assert!(FileConfig::parse("batch_sise = 3").is_err());
    }

    #[test]
    fn test_config_file_loaded_from_args() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("snapship.toml");
        std::fs::write(&file, "batch_size = 9\n").unwrap();

        let config =
            ShipConfig::from_args(args(tmp.path(), &["--config", file.to_str().unwrap()])).unwrap();
        assert_eq!(config.batcher.batch_size, 9);
    }

    #[test]
    fn test_missing_watch_dir_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = ShipConfig::merge(args(&tmp.path().join("nope"), &[]), FileConfig::default())
            .unwrap_err();
        assert!(matches!(err, ShipError::Config(_)));
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let tmp = TempDir::new().unwrap();
        for extra in [
            &["--batch-size", "0"][..],
            &["--relay-capacity", "0"][..],
            &["--poll-interval", "0"][..],
            &["--snapshot-interval", "0"][..],
        ] {
            let err = ShipConfig::merge(args(tmp.path(), extra), FileConfig::default());
            assert!(err.is_err(), "{:?} should be rejected", extra);
        }
    }

    #[test]
    fn test_partial_credentials_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = ShipConfig::merge(
            args(tmp.path(), &["--access-key", "AKIA", "--bucket", "snaps"]),
            FileConfig::default(),
        )
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("--secret-key"), "{}", msg);
        assert!(!msg.contains("--bucket"), "{}", msg);
    }

    #[test]
    fn test_remote_without_credentials_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = ShipConfig::merge(args(tmp.path(), &["--sink", "remote"]), FileConfig::default());
        assert!(matches!(err, Err(ShipError::Config(_))));
    }

    #[test]
    fn test_local_sink_ignores_credentials() {
        let tmp = TempDir::new().unwrap();
        let config = ShipConfig::merge(
            args(tmp.path(), &["--sink", "local", "--access-key", "AKIA"]),
            FileConfig::default(),
        )
        .unwrap();
        assert!(matches!(config.sink, SinkSelection::Local { .. }));
    }

    #[test]
    #[cfg(feature = "s3")]
    fn test_full_credentials_select_remote() {
        let tmp = TempDir::new().unwrap();
        let config = ShipConfig::merge(
            args(
                tmp.path(),
                &["--access-key", "AKIA", "--secret-key", "s3cr3t", "--bucket", "snaps"],
            ),
            FileConfig::default(),
        )
        .unwrap();

        let SinkSelection::Remote(creds) = config.sink else {
            panic!("Expected remote sink");
        };
        assert_eq!(creds.bucket, "snaps");
        assert_eq!(creds.region, DEFAULT_REGION);
        assert!(!format!("{:?}", creds).contains("s3cr3t"));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde(Path::new("/abs/path")), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/snaps")), home.join("snaps"));
            assert_eq!(expand_tilde(Path::new("~")), home);
        }
    }
}
