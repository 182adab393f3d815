use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;
use crate::queue::RepeatMode;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Tracks requested per page (`count` query parameter).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Retry, timeout and concurrency knobs for catalog fetching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Fixed wait between attempts.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Concurrent page fetches during a bulk run.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pages fetched by one `load_scope` run before returning to idle.
    /// 0 keeps going until the scope is exhausted.
    #[serde(default)]
    pub pages_per_run: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Persistent cache directory. Unset means a session-only store that is
    /// removed when the process exits. Genre pages cached here can go stale;
    /// delete the directory to refresh them.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// 0..=100
    #[serde(default = "default_volume")]
    pub default_volume: u8,
    #[serde(default)]
    pub repeat: RepeatMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            page_size: default_page_size(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_ms: default_backoff_ms(),
            workers: default_workers(),
            pages_per_run: 0,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn page_budget(&self) -> Option<u32> {
        (self.pages_per_run > 0).then_some(self.pages_per_run)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            dir: None,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            repeat: RepeatMode::Off,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

fn default_base_url() -> String {
    "https://api-v2.hearthis.at".to_string()
}

fn default_page_size() -> u32 {
    20
}

fn default_user_agent() -> String {
    format!("hearthis-daemon/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_workers() -> usize {
    5
}

fn default_cache_enabled() -> bool {
    true
}

fn default_volume() -> u8 {
    50
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api.page_size, 20);
        assert!(config.api.base_url.starts_with("https://"));
        assert_eq!(config.fetch.max_retries, 3);
        assert_eq!(config.fetch.timeout(), Duration::from_secs(20));
        assert_eq!(config.fetch.backoff(), Duration::from_secs(1));
        assert_eq!(config.fetch.workers, 5);
        assert_eq!(config.fetch.page_budget(), None);
        assert!(config.cache.enabled);
        assert!(config.cache.dir.is_none());
        assert_eq!(config.playback.default_volume, 50);
        assert!(config.daemon.state_file.ends_with("hearthis/state.json"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [fetch]
            workers = 2
            pages_per_run = 3

            [playback]
            repeat = "all"
            "#,
        )
        .unwrap();
        assert_eq!(config.fetch.workers, 2);
        assert_eq!(config.fetch.max_retries, 3);
        assert_eq!(config.fetch.page_budget(), Some(3));
        assert_eq!(config.playback.repeat, RepeatMode::All);
        assert_eq!(config.api.page_size, 20);
    }
}
