//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.dgfetch.toml` files.

use crate::batch::RetryPolicy;
use crate::plugin::PluginRoute;
use crate::session::{EnvToken, StaticToken, TokenSource};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".dgfetch.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// API endpoints.
    #[serde(default)]
    pub api: ApiConfig,

    /// Session token settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Batched fetch settings.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Routes registered with the shell.
    #[serde(default = "default_routes")]
    pub routes: Vec<PluginRoute>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            session: SessionConfig::default(),
            batch: BatchConfig::default(),
            routes: default_routes(),
        }
    }
}

/// Catalogue, download and IDS endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Catalogue API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Download API base URL (investigation sizes).
    #[serde(default = "default_download_api_url")]
    pub download_api_url: String,

    /// IDS base URL (download links).
    #[serde(default = "default_ids_url")]
    pub ids_url: String,

    /// Facility name sent to the download API.
    #[serde(default = "default_facility_name")]
    pub facility_name: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            download_api_url: default_download_api_url(),
            ids_url: default_ids_url(),
            facility_name: default_facility_name(),
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_download_api_url() -> String {
    "http://localhost:8181/topcat".to_string()
}

fn default_ids_url() -> String {
    "http://localhost:8181/ids".to_string()
}

fn default_facility_name() -> String {
    "LILS".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Where the session id comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Fixed session id. Takes precedence over `token_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Environment variable read on every request when no token is set.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_env: default_token_env(),
        }
    }
}

fn default_token_env() -> String {
    "DGFETCH_TOKEN".to_string()
}

/// Settings for the batched aggregators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Completions between published snapshots.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retries after the first attempt of a failed fetch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Seconds a cached value stays fresh. Unset means forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_seconds: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            stale_seconds: None,
        }
    }
}

fn default_batch_size() -> usize {
    crate::batch::state::DEFAULT_BATCH_SIZE
}

fn default_max_retries() -> u32 {
    crate::batch::retry::DEFAULT_MAX_RETRIES
}

fn default_retry_base_delay() -> u64 {
    crate::batch::retry::DEFAULT_BASE_DELAY_MS
}

fn default_retry_max_delay() -> u64 {
    crate::batch::retry::DEFAULT_MAX_DELAY_MS
}

fn default_routes() -> Vec<PluginRoute> {
    vec![
        PluginRoute {
            section: "Data".to_string(),
            link: "/browse/investigation".to_string(),
            display_name: "Browse".to_string(),
            admin: None,
            hide_from_menu: None,
            order: 0,
        },
        PluginRoute {
            section: "Data".to_string(),
            link: "/download".to_string(),
            display_name: "Download".to_string(),
            admin: None,
            hide_from_menu: Some(true),
            order: 1,
        },
    ]
}

impl BatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn stale_time(&self) -> Option<Duration> {
        self.stale_seconds.map(Duration::from_secs)
    }
}

impl SessionConfig {
    /// Builds the token source requests authenticate with.
    pub fn token_source(&self) -> Arc<dyn TokenSource> {
        match &self.token {
            Some(token) => Arc::new(StaticToken::new(token.clone())),
            None => Arc::new(EnvToken::new(self.token_env.clone())),
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        Self::load_from_dir(Path::new("."))
    }

    /// Try to load `.dgfetch.toml` from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join(DEFAULT_CONFIG_FILE);

        if config_path.exists() {
            Ok(Some(Self::load(&config_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref url) = args.api_url {
            self.api.api_url = url.clone();
        }
        if let Some(ref url) = args.download_api_url {
            self.api.download_api_url = url.clone();
        }
        if let Some(ref facility) = args.facility {
            self.api.facility_name = facility.clone();
        }
        if let Some(timeout) = args.timeout {
            self.api.timeout_seconds = timeout;
        }

        if let Some(ref token) = args.token {
            self.session.token = Some(token.clone());
        }

        if let Some(batch_size) = args.batch_size {
            self.batch.batch_size = batch_size;
        }
        if let Some(retries) = args.retries {
            self.batch.max_retries = retries;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
