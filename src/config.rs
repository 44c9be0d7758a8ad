use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use strum_macros::Display;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Directory for the rolling log file. Defaults to "logs".
    pub log_directory: Option<String>,
    /// Per-module overrides, e.g. `{"twitch_opticon::internal::status": Debug}`.
    pub module_levels: BTreeMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_directory: None,
            module_levels: BTreeMap::new(),
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directive string, e.g. "info,reqwest=warn".
    pub fn filter_directive(&self) -> String {
        let mut filter = self.level.to_string();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level));
        }
        filter
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Twitch application client id.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Redirect target registered for release builds.
    #[serde(default = "default_prod_redirect_uri")]
    pub prod_redirect_uri: String,
    /// Redirect target registered for development builds.
    #[serde(default = "default_dev_redirect_uri")]
    pub dev_redirect_uri: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_helix_base_url")]
    pub helix_base_url: String,
    #[serde(default = "default_id_base_url")]
    pub id_base_url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_search_stale_secs")]
    pub search_stale_secs: u64,
    #[serde(default = "default_search_debounce_ms")]
    pub search_debounce_ms: u64,
    /// Where persisted blobs live. Defaults to the OS config directory.
    pub data_dir: Option<String>,
    /// Emit per-operation cache timings at debug level.
    pub enable_cache_metrics: bool,
    pub logging: LoggingConfig,
}

fn default_client_id() -> String {
    "n2fvcp3z483fegteujz9zzrrurikz6".to_string()
}

fn default_prod_redirect_uri() -> String {
    "https://pbanddev.github.io/TwitchOpticon/".to_string()
}

fn default_dev_redirect_uri() -> String {
    "http://localhost:3000".to_string()
}

fn default_scope() -> String {
    "user:read:email".to_string()
}

fn default_authorize_url() -> String {
    "https://id.twitch.tv/oauth2/authorize".to_string()
}

fn default_helix_base_url() -> String {
    "https://api.twitch.tv/helix/".to_string()
}

fn default_id_base_url() -> String {
    "https://id.twitch.tv/oauth2/".to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_search_stale_secs() -> u64 {
    300
}

fn default_search_debounce_ms() -> u64 {
    400
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            prod_redirect_uri: default_prod_redirect_uri(),
            dev_redirect_uri: default_dev_redirect_uri(),
            scope: default_scope(),
            authorize_url: default_authorize_url(),
            helix_base_url: default_helix_base_url(),
            id_base_url: default_id_base_url(),
            poll_interval_secs: default_poll_interval_secs(),
            search_stale_secs: default_search_stale_secs(),
            search_debounce_ms: default_search_debounce_ms(),
            data_dir: None,
            enable_cache_metrics: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Self {
        // Look for config.ron in current directory or next to executable
        let mut candidates = Vec::new();

        // 1. Current working directory
        candidates.push(PathBuf::from("config.ron"));

        // 2. Next to executable
        if let Ok(exe) = std::env::current_exe()
            && let Some(dir) = exe.parent()
        {
            candidates.push(dir.join("config.ron"));
        }

        for path in candidates {
            if path.exists()
                && let Ok(content) = fs::read_to_string(&path)
            {
                match Self::parse(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse config at {}: {}", path.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Self::default()
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str::<AppConfig>(content)?)
    }

    /// Development builds redirect to the local dev server.
    pub fn redirect_uri(&self) -> &str {
        match cfg!(debug_assertions) {
            true => &self.dev_redirect_uri,
            false => &self.prod_redirect_uri,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn search_stale_time(&self) -> Duration {
        Duration::from_secs(self.search_stale_secs)
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }
}
