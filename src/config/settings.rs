//! Configuration settings for s3mirror
//!
//! Defines the CLI arguments, the JSON configuration file and the runtime
//! settings handed to each component. Values are layered: built-in defaults,
//! then the config file, then `S3MIRROR_*` environment variables, then flags.

use crate::error::{MirrorError, Result};
use crate::storage::{CopyOptions, MIN_PART_SIZE};
use crate::substrate::QueueConfig;
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// s3mirror - reliable bulk object mirroring
#[derive(Parser, Debug, Clone)]
#[command(name = "s3mirror")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mirror large object sets between storage locations")]
#[command(long_about = r#"
s3mirror copies every object under a source location to a destination
location, skipping keys the destination already has. Work is spread over a
bounded queue, survives restarts, and can be watched or cancelled while it runs.

Examples:
  s3mirror plan genomics/20x/ backup/20x/           # Show what would be copied
  s3mirror run genomics/20x/ backup/20x/            # Copy and wait
  s3mirror run src dst --keys a.bin,b.bin           # Copy selected keys only
  s3mirror serve --port 8000                        # Run the HTTP API
"#)]
pub struct CliArgs {
    /// JSON configuration file
    #[arg(long, env = "S3MIRROR_CONFIG", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Directory for the execution journal and published jobs
    #[arg(long, env = "S3MIRROR_STATE_DIR", value_name = "PATH", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Keep all job state in memory (nothing survives a restart)
    #[arg(long, global = true)]
    pub ephemeral: bool,

    /// Storage backend
    #[arg(long, env = "S3MIRROR_BACKEND", value_enum, global = true)]
    pub backend: Option<BackendKind>,

    /// Root directory for the local backend (buckets are subdirectories)
    #[arg(long, env = "S3MIRROR_LOCAL_ROOT", value_name = "PATH", global = true)]
    pub local_root: Option<PathBuf>,

    /// S3 region
    #[arg(long, env = "S3MIRROR_REGION", global = true)]
    pub region: Option<String>,

    /// S3-compatible endpoint URL
    #[arg(long, env = "S3MIRROR_ENDPOINT_URL", value_name = "URL", global = true)]
    pub endpoint_url: Option<String>,

    /// Use path-style S3 addressing
    #[arg(long, global = true)]
    pub force_path_style: bool,

    /// Maximum transfers running at once across all workers
    #[arg(long, env = "S3MIRROR_GLOBAL_CONCURRENCY", value_name = "NUM", global = true)]
    pub global_concurrency: Option<usize>,

    /// Maximum transfers running at once on one worker
    #[arg(long, env = "S3MIRROR_WORKER_CONCURRENCY", value_name = "NUM", global = true)]
    pub worker_concurrency: Option<usize>,

    /// Maximum parts of one object copied in parallel
    #[arg(long, env = "S3MIRROR_MAX_PARALLEL_PARTS", value_name = "NUM", global = true)]
    pub max_parallel_parts: Option<usize>,

    /// Part size for ranged copies (e.g., 16M)
    #[arg(long, env = "S3MIRROR_PART_SIZE", value_name = "SIZE", global = true)]
    pub part_size: Option<String>,

    /// Attempts per listing before giving up
    #[arg(long, env = "S3MIRROR_LIST_ATTEMPTS", value_name = "NUM", global = true)]
    pub list_attempts: Option<u32>,

    /// Attempts per object transfer before giving up
    #[arg(long, env = "S3MIRROR_TRANSFER_ATTEMPTS", value_name = "NUM", global = true)]
    pub transfer_attempts: Option<u32>,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output format
    #[arg(long, env = "S3MIRROR_LOG_FORMAT", value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP API and the transfer workers
    #[command(name = "serve")]
    Serve {
        /// Bind address
        #[arg(short, long, env = "S3MIRROR_BIND")]
        bind: Option<String>,
        /// Listen port
        #[arg(short, long, env = "S3MIRROR_PORT")]
        port: Option<u16>,
        /// Bearer token required on every request
        #[arg(long, env = "S3MIRROR_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
        /// Disable CORS headers
        #[arg(long)]
        no_cors: bool,
    },

    /// Start a transfer and wait for it to finish
    #[command(name = "run")]
    Run {
        /// Source location (bucket, bucket/prefix/ or s3://bucket/prefix/)
        source: String,
        /// Destination location
        destination: String,
        /// Copy only these keys (comma-separated, relative to the source)
        #[arg(long, value_delimiter = ',')]
        keys: Option<Vec<String>>,
        /// Resume or attach to an existing job
        #[arg(long, value_name = "JOB")]
        job_id: Option<String>,
        /// Status polling interval (e.g., 500ms, 2s)
        #[arg(long, default_value = "1s", value_name = "DURATION")]
        poll_interval: String,
        /// Disable the progress display
        #[arg(long)]
        no_progress: bool,
    },

    /// Show which objects a transfer would copy, without copying
    #[command(name = "plan")]
    Plan {
        /// Source location
        source: String,
        /// Destination location
        destination: String,
        /// Restrict to these keys (comma-separated)
        #[arg(long, value_delimiter = ',')]
        keys: Option<Vec<String>>,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Storage backend selector
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Local directories
    Local,
    /// Amazon S3 or an S3-compatible service
    S3,
}

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Storage backend configuration
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Local directories under `root`
    Local {
        /// Directory whose subdirectories are buckets
        root: PathBuf,
    },
    /// Amazon S3 or an S3-compatible service
    S3 {
        /// Region
        #[serde(default = "default_region")]
        region: String,
        /// Custom endpoint
        #[serde(default)]
        endpoint_url: Option<String>,
        /// Path-style addressing
        #[serde(default)]
        force_path_style: bool,
        /// Static access key (falls back to the AWS credential chain)
        #[serde(default)]
        access_key_id: Option<String>,
        /// Static secret key
        #[serde(default)]
        secret_access_key: Option<String>,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local {
            root: PathBuf::from("."),
        }
    }
}

// Credentials never reach logs or `-v` output.
impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { root } => f.debug_struct("Local").field("root", root).finish(),
            Self::S3 {
                region,
                endpoint_url,
                force_path_style,
                access_key_id,
                secret_access_key,
            } => f
                .debug_struct("S3")
                .field("region", region)
                .field("endpoint_url", endpoint_url)
                .field("force_path_style", force_path_style)
                .field("access_key_id", &access_key_id.as_ref().map(|_| "<redacted>"))
                .field("secret_access_key", &secret_access_key.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

impl fmt::Display for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { root } => write!(f, "local ({})", root.display()),
            Self::S3 {
                region,
                endpoint_url,
                access_key_id,
                ..
            } => {
                write!(f, "s3 ({}", region)?;
                if let Some(url) = endpoint_url {
                    write!(f, ", {}", url)?;
                }
                if access_key_id.is_some() {
                    f.write_str(", static credentials")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Concurrency limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyLimits {
    /// Transfers running at once across all workers
    pub global_concurrency: usize,
    /// Transfers running at once on one worker
    pub worker_concurrency: usize,
    /// Parts of one object copied in parallel
    pub max_parallel_parts: usize,
    /// Part size in bytes
    pub part_size: u64,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            global_concurrency: 18,
            worker_concurrency: 3,
            max_parallel_parts: 100,
            part_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl ConcurrencyLimits {
    /// Options for one object copy
    pub fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            max_parallel_parts: self.max_parallel_parts,
            part_size: self.part_size,
        }
    }

    /// Work queue settings
    pub fn queue_config(&self, name: impl Into<String>) -> QueueConfig {
        QueueConfig {
            name: name.into(),
            global_concurrency: self.global_concurrency,
            worker_concurrency: self.worker_concurrency,
        }
    }
}

/// Retry budgets and backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts for a complete listing
    pub list_attempts: u32,
    /// Attempts for one object transfer
    pub transfer_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay_ms: u64,
    /// Upper bound on any delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            list_attempts: 3,
            transfer_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiServerConfig {
    /// Bind address
    pub bind: String,
    /// Port
    pub port: u16,
    /// Enable CORS for all origins
    pub cors_enabled: bool,
    /// API key for authentication (optional)
    pub api_key: Option<String>,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
            cors_enabled: true,
            api_key: None,
            max_body_size: 10 * 1024 * 1024, // 10 MB
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Journal and event directory; `None` keeps state in memory
    pub state_dir: Option<PathBuf>,
    /// Storage backend
    pub backend: BackendConfig,
    /// Concurrency limits
    pub limits: ConcurrencyLimits,
    /// Retry budgets
    pub retry: RetryPolicy,
    /// HTTP API
    pub server: ApiServerConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            state_dir: Some(PathBuf::from("./.s3mirror")),
            backend: BackendConfig::default(),
            limits: ConcurrencyLimits::default(),
            retry: RetryPolicy::default(),
            server: ApiServerConfig::default(),
        }
    }
}

impl MirrorConfig {
    /// Read a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| MirrorError::io(path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| MirrorError::config(format!("{}: {}", path.display(), e)))
    }

    /// Build the configuration from CLI arguments (file, env and flags)
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_cli(args)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values given on the command line or through the environment
    pub fn apply_cli(&mut self, args: &CliArgs) -> Result<()> {
        if args.ephemeral {
            self.state_dir = None;
        } else if let Some(dir) = &args.state_dir {
            self.state_dir = Some(dir.clone());
        }

        match args.backend {
            Some(BackendKind::Local) => {
                if !matches!(self.backend, BackendConfig::Local { .. }) {
                    self.backend = BackendConfig::default();
                }
            }
            Some(BackendKind::S3) => {
                if !matches!(self.backend, BackendConfig::S3 { .. }) {
                    self.backend = BackendConfig::S3 {
                        region: default_region(),
                        endpoint_url: None,
                        force_path_style: false,
                        access_key_id: None,
                        secret_access_key: None,
                    };
                }
            }
            None => {}
        }

        match &mut self.backend {
            BackendConfig::Local { root } => {
                if let Some(local_root) = &args.local_root {
                    *root = local_root.clone();
                }
            }
            BackendConfig::S3 {
                region,
                endpoint_url,
                force_path_style,
                ..
            } => {
                if let Some(r) = &args.region {
                    *region = r.clone();
                }
                if let Some(url) = &args.endpoint_url {
                    *endpoint_url = Some(url.clone());
                }
                if args.force_path_style {
                    *force_path_style = true;
                }
            }
        }

        if let Some(n) = args.global_concurrency {
            self.limits.global_concurrency = n;
        }
        if let Some(n) = args.worker_concurrency {
            self.limits.worker_concurrency = n;
        }
        if let Some(n) = args.max_parallel_parts {
            self.limits.max_parallel_parts = n;
        }
        if let Some(size) = &args.part_size {
            self.limits.part_size = parse_size(size)
                .map_err(|e| MirrorError::config(format!("Invalid part size: {}", e)))?;
        }
        if let Some(n) = args.list_attempts {
            self.retry.list_attempts = n;
        }
        if let Some(n) = args.transfer_attempts {
            self.retry.transfer_attempts = n;
        }

        if let Commands::Serve {
            bind,
            port,
            api_key,
            no_cors,
        } = &args.command
        {
            if let Some(bind) = bind {
                self.server.bind = bind.clone();
            }
            if let Some(port) = port {
                self.server.port = *port;
            }
            if let Some(key) = api_key {
                self.server.api_key = Some(key.clone());
            }
            if *no_cors {
                self.server.cors_enabled = false;
            }
        }

        Ok(())
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.global_concurrency == 0 || limits.worker_concurrency == 0 {
            return Err(MirrorError::config("concurrency limits must be non-zero"));
        }
        if limits.worker_concurrency > limits.global_concurrency {
            return Err(MirrorError::config(format!(
                "worker_concurrency ({}) exceeds global_concurrency ({})",
                limits.worker_concurrency, limits.global_concurrency
            )));
        }
        if limits.max_parallel_parts == 0 || limits.part_size == 0 {
            return Err(MirrorError::config("part settings must be non-zero"));
        }
        if matches!(self.backend, BackendConfig::S3 { .. }) && limits.part_size < MIN_PART_SIZE {
            return Err(MirrorError::config(format!(
                "part_size must be at least {} for S3",
                humansize::format_size(MIN_PART_SIZE, humansize::BINARY)
            )));
        }
        if self.retry.list_attempts == 0 || self.retry.transfer_attempts == 0 {
            return Err(MirrorError::config("retry attempts must be at least 1"));
        }
        Ok(())
    }

    /// Directory holding execution records
    pub fn executions_dir(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("executions"))
    }

    /// Directory holding published events
    pub fn events_dir(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("events"))
    }
}

/// Parse human-readable size string to bytes
pub fn parse_size(size: &str) -> std::result::Result<u64, String> {
    let size = size.trim().to_uppercase();

    if size.is_empty() {
        return Err("Empty size string".to_string());
    }

    let (num_str, multiplier) = if size.ends_with("TB") || size.ends_with('T') {
        let num = size.trim_end_matches(|c| c == 'T' || c == 'B');
        (num, 1024u64 * 1024 * 1024 * 1024)
    } else if size.ends_with("GB") || size.ends_with('G') {
        let num = size.trim_end_matches(|c| c == 'G' || c == 'B');
        (num, 1024u64 * 1024 * 1024)
    } else if size.ends_with("MB") || size.ends_with('M') {
        let num = size.trim_end_matches(|c| c == 'M' || c == 'B');
        (num, 1024u64 * 1024)
    } else if size.ends_with("KB") || size.ends_with('K') {
        let num = size.trim_end_matches(|c| c == 'K' || c == 'B');
        (num, 1024u64)
    } else if size.ends_with('B') {
        let num = size.trim_end_matches('B');
        (num, 1u64)
    } else {
        // Assume bytes if no suffix
        (size.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", num_str))?;
    if num < 0.0 {
        return Err(format!("Negative size: {}", num_str));
    }

    Ok((num * multiplier as f64) as u64)
}
