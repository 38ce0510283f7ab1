// Agent configuration
//
// Loaded from an optional TOML file, then overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::proc::DEFAULT_PROC_ROOT;

/// Default collection endpoint
pub const DEFAULT_ENDPOINT_URL: &str = "https://my.optscale.com:443/arcee/v2";

/// Environment variable overriding [`ArceeConfig::endpoint_url`]
pub const ENV_ENDPOINT_URL: &str = "ARCEE_ENDPOINT_URL";
/// Environment variable overriding [`ArceeConfig::token`]
pub const ENV_TOKEN: &str = "ARCEE_TOKEN";
/// Environment variable overriding [`ArceeConfig::heartbeat_period_secs`]
pub const ENV_HEARTBEAT_PERIOD: &str = "ARCEE_HEARTBEAT_PERIOD";

/// Agent configuration
///
/// # Example
/// ```
/// use arcee::config::ArceeConfig;
///
/// let config = ArceeConfig::from_toml_str("heartbeat_period_secs = 5").unwrap();
/// assert_eq!(config.heartbeat_period_secs, 5);
/// assert!(config.instrumentation.s3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArceeConfig {
    /// Collection endpoint base URL
    pub endpoint_url: String,

    /// Profiling token identifying the organization
    pub token: Option<String>,

    /// Verify TLS certificates when talking to the endpoint
    pub ssl: bool,

    /// Seconds between two heartbeats
    ///
    /// Default: 1
    pub heartbeat_period_secs: u64,

    /// Where host and process statistics are read from
    ///
    /// Default: /proc
    pub proc_root: PathBuf,

    pub instrumentation: InstrumentationConfig,

    pub transfer: TransferConfig,
}

impl Default for ArceeConfig {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            token: None,
            ssl: true,
            heartbeat_period_secs: 1,
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            instrumentation: InstrumentationConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

/// Which client packages get instrumented
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    pub s3: bool,
    pub ec2: bool,
    pub redshift: bool,

    /// Methods excluded from the generic call tally
    pub ignored_methods: Vec<String>,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            s3: true,
            ec2: true,
            redshift: true,
            ignored_methods: Vec::new(),
        }
    }
}

impl InstrumentationConfig {
    /// Every package switched off
    pub fn disabled() -> Self {
        Self {
            s3: false,
            ec2: false,
            redshift: false,
            ignored_methods: Vec::new(),
        }
    }
}

/// Transfer manager tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Uploads and downloads at or above this size are split into parts
    pub multipart_threshold: u64,

    /// Size of each part
    pub part_size: u64,

    /// Worker threads in the transfer pool
    pub max_workers: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: 8 * 1024 * 1024,
            part_size: 8 * 1024 * 1024,
            max_workers: 10,
        }
    }
}

impl ArceeConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ArceeConfig =
            toml::from_str(contents).context("Failed to parse arcee configuration")?;
        config
            .validate()
            .map_err(|msg| anyhow::anyhow!("Invalid arcee configuration: {}", msg))?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    /// Apply `ARCEE_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var(ENV_ENDPOINT_URL) {
            self.endpoint_url = url;
        }
        if let Ok(token) = std::env::var(ENV_TOKEN) {
            self.token = Some(token);
        }
        if let Ok(period) = std::env::var(ENV_HEARTBEAT_PERIOD) {
            self.heartbeat_period_secs = period
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", ENV_HEARTBEAT_PERIOD, period))?;
        }
        self.validate()
            .map_err(|msg| anyhow::anyhow!("Invalid arcee configuration: {}", msg))?;
        Ok(self)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.endpoint_url.trim().is_empty() {
            return Err("endpoint_url must not be empty".to_string());
        }

        if !self.endpoint_url.starts_with("http://") && !self.endpoint_url.starts_with("https://")
        {
            return Err(format!(
                "endpoint_url must be an http(s) URL, got {}",
                self.endpoint_url
            ));
        }

        if self.heartbeat_period_secs == 0 {
            return Err("heartbeat_period_secs must be >= 1".to_string());
        }

        if self.proc_root.as_os_str().is_empty() {
            return Err("proc_root must not be empty".to_string());
        }

        if self.transfer.part_size == 0 {
            return Err("transfer.part_size must be > 0".to_string());
        }

        if self.transfer.multipart_threshold < self.transfer.part_size {
            return Err(format!(
                "transfer.multipart_threshold ({}) must be >= transfer.part_size ({})",
                self.transfer.multipart_threshold, self.transfer.part_size
            ));
        }

        if self.transfer.max_workers == 0 {
            return Err("transfer.max_workers must be >= 1".to_string());
        }

        Ok(())
    }
}
