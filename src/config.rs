//! Configuration file parser for ~/.config/feedpost/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Environment variables override file values, and [`Config::validate`] must
//! pass before a run is assembled from the result.
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::content::DEFAULT_FALLBACK_IMAGE_URL;
use crate::pipeline::PipelineSettings;
use crate::publish::Credentials;

pub const ENV_FEED_URL: &str = "FEEDPOST_FEED_URL";
pub const ENV_IDENTIFIER: &str = "BSKY_IDENTIFIER";
pub const ENV_APP_PASSWORD: &str = "BSKY_APP_PASSWORD";
pub const ENV_SERVICE_URL: &str = "BSKY_SERVICE_URL";
pub const ENV_STATE_PATH: &str = "FEEDPOST_STATE_PATH";

const DEFAULT_SERVICE_URL: &str = "https://bsky.social";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A required value was set neither in the file nor the environment.
    #[error("Missing required setting `{key}` (or env var {env})")]
    Missing {
        key: &'static str,
        env: &'static str,
    },

    #[error("Invalid URL for `{key}`: {source}")]
    InvalidUrl {
        key: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("`{key}` must use http or https, got `{scheme}`")]
    UnsupportedScheme { key: &'static str, scheme: String },

    #[error("Invalid range: {0}")]
    InvalidRange(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// The custom `Debug` impl masks `app_password`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RSS/Atom feed to poll.
    pub feed_url: Option<String>,

    /// Account handle or DID used to log in.
    pub identifier: Option<String>,

    /// App password for the account. Prefer the env var over the file.
    #[serde(deserialize_with = "deserialize_secret")]
    pub app_password: Option<SecretString>,

    /// PDS base URL.
    pub service_url: String,

    /// Dedup store location. Defaults to `state.json` in the config dir.
    pub state_path: Option<PathBuf>,

    pub max_entries_per_run: usize,

    /// Fetch gate: a run only fetches when this many minutes (drawn per run
    /// from the range) have passed since the last fetch.
    pub gate_min_minutes: u64,
    pub gate_max_minutes: u64,

    /// Pause between consecutive posts, drawn per post from the range.
    pub pacing_min_secs: u64,
    pub pacing_max_secs: u64,

    /// Leave failed publishes unrecorded so the next run retries them.
    pub retry_failed_posts: bool,

    /// Image used when a page offers none. An empty string turns it off.
    pub fallback_image_url: Option<String>,

    /// Language tags attached to posts (e.g. `["en"]`).
    pub post_langs: Vec<String>,

    pub lock_stale_minutes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_url: None,
            identifier: None,
            app_password: None,
            service_url: DEFAULT_SERVICE_URL.to_string(),
            state_path: None,
            max_entries_per_run: 8,
            gate_min_minutes: 30,
            gate_max_minutes: 120,
            pacing_min_secs: 120,
            pacing_max_secs: 300,
            retry_failed_posts: false,
            fallback_image_url: Some(DEFAULT_FALLBACK_IMAGE_URL.to_string()),
            post_langs: Vec::new(),
            lock_stale_minutes: 360,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("feed_url", &self.feed_url)
            .field("identifier", &self.identifier)
            .field(
                "app_password",
                &self.app_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("service_url", &self.service_url)
            .field("state_path", &self.state_path)
            .field("max_entries_per_run", &self.max_entries_per_run)
            .field("gate_min_minutes", &self.gate_min_minutes)
            .field("gate_max_minutes", &self.gate_max_minutes)
            .field("pacing_min_secs", &self.pacing_min_secs)
            .field("pacing_max_secs", &self.pacing_max_secs)
            .field("retry_failed_posts", &self.retry_failed_posts)
            .field("fallback_image_url", &self.fallback_image_url)
            .field("post_langs", &self.post_langs)
            .field("lock_stale_minutes", &self.lock_stale_minutes)
            .finish()
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.map(SecretString::from))
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 14] = [
        "feed_url",
        "identifier",
        "app_password",
        "service_url",
        "state_path",
        "max_entries_per_run",
        "gate_min_minutes",
        "gate_max_minutes",
        "pacing_min_secs",
        "pacing_max_secs",
        "retry_failed_posts",
        "fallback_image_url",
        "post_langs",
        "lock_stale_minutes",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Overlay values from `lookup`; empty values are ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_FEED_URL) {
            self.feed_url = Some(v);
        }
        if let Some(v) = get(ENV_IDENTIFIER) {
            self.identifier = Some(v);
        }
        if let Some(v) = get(ENV_APP_PASSWORD) {
            self.app_password = Some(SecretString::from(v));
        }
        if let Some(v) = get(ENV_SERVICE_URL) {
            self.service_url = v;
        }
        if let Some(v) = get(ENV_STATE_PATH) {
            self.state_path = Some(PathBuf::from(v));
        }
    }

    /// Checks that everything a run needs is present and well-formed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.feed_url()?;
        self.service_url()?;
        self.credentials()?;
        self.fallback_image_url()?;

        if self.gate_min_minutes > self.gate_max_minutes {
            return Err(ConfigError::InvalidRange(format!(
                "gate_min_minutes ({}) exceeds gate_max_minutes ({})",
                self.gate_min_minutes, self.gate_max_minutes
            )));
        }
        if self.pacing_min_secs > self.pacing_max_secs {
            return Err(ConfigError::InvalidRange(format!(
                "pacing_min_secs ({}) exceeds pacing_max_secs ({})",
                self.pacing_min_secs, self.pacing_max_secs
            )));
        }
        if self.max_entries_per_run == 0 {
            return Err(ConfigError::InvalidRange(
                "max_entries_per_run must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn feed_url(&self) -> Result<Url, ConfigError> {
        let raw = self.feed_url.as_deref().ok_or(ConfigError::Missing {
            key: "feed_url",
            env: ENV_FEED_URL,
        })?;
        parse_http_url("feed_url", raw)
    }

    pub fn service_url(&self) -> Result<Url, ConfigError> {
        let mut url = parse_http_url("service_url", &self.service_url)?;
        // `Url::join` replaces the last segment unless the path ends in '/'
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    pub fn fallback_image_url(&self) -> Result<Option<Url>, ConfigError> {
        self.fallback_image_url
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| parse_http_url("fallback_image_url", raw))
            .transpose()
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let identifier = self
            .identifier
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing {
                key: "identifier",
                env: ENV_IDENTIFIER,
            })?;
        let password = self.app_password.clone().ok_or(ConfigError::Missing {
            key: "app_password",
            env: ENV_APP_PASSWORD,
        })?;
        Ok(Credentials {
            identifier,
            password,
        })
    }

    /// Dedup store path, defaulting to `state.json` under `config_dir`.
    pub fn state_path_in(&self, config_dir: &Path) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| config_dir.join("state.json"))
    }

    pub fn pipeline_settings(&self, force: bool) -> PipelineSettings {
        PipelineSettings {
            max_entries: self.max_entries_per_run,
            gate_min: Duration::from_secs(self.gate_min_minutes * 60),
            gate_max: Duration::from_secs(self.gate_max_minutes * 60),
            pacing_min: Duration::from_secs(self.pacing_min_secs),
            pacing_max: Duration::from_secs(self.pacing_max_secs),
            retry_failed_posts: self.retry_failed_posts,
            lock_stale: Duration::from_secs(self.lock_stale_minutes * 60),
            force,
        }
    }
}

fn parse_http_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl { key, source })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme {
            key,
            scheme: other.to_string(),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================
