use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where the remote media service lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Play the upstream URL instead of the service's proxy route.
    #[serde(default)]
    pub prefer_direct_stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_autoplay")]
    pub autoplay: bool,
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,
    /// Request related tracks once this many or fewer remain after the current one.
    #[serde(default = "default_refill_threshold")]
    pub refill_threshold: usize,
    /// Fraction of the current track after which the next one is preloaded.
    #[serde(default = "default_preload_at")]
    pub preload_at: f64,
    #[serde(default = "default_import_poll_ms")]
    pub import_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            prefer_direct_stream: false,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            autoplay: default_autoplay(),
            max_queue_len: default_max_queue_len(),
            refill_threshold: default_refill_threshold(),
            preload_at: default_preload_at(),
            import_poll_ms: default_import_poll_ms(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
        }
    }
}

fn default_pid_file() -> PathBuf {
    platform::data_dir().join("daemon.pid")
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_autoplay() -> bool {
    true
}

fn default_max_queue_len() -> usize {
    20
}

fn default_refill_threshold() -> usize {
    3
}

fn default_preload_at() -> f64 {
    0.8
}

fn default_import_poll_ms() -> u64 {
    1000
}

fn default_volume() -> f32 {
    0.5
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
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.playback.preload_at = config.playback.preload_at.clamp(0.0, 1.0);
        config.playback.max_queue_len = config.playback.max_queue_len.max(1);
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
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8990);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.playback.max_queue_len, 20);
        assert_eq!(config.playback.refill_threshold, 3);
        assert!((config.playback.preload_at - 0.8).abs() < f64::EPSILON);
        assert!(config.playback.autoplay);
        assert!(config.daemon.state_file.ends_with("cadence/state.json"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [service]
            base_url = "http://media.local:5000"

            [playback]
            autoplay = false
            preload_at = 1.7
            "#,
        )
        .unwrap();
        assert_eq!(config.service.base_url, "http://media.local:5000");
        assert!(!config.service.prefer_direct_stream);
        assert!(!config.playback.autoplay);
        assert_eq!(config.playback.preload_at, 1.0);
        assert_eq!(config.playback.max_queue_len, 20);
        assert_eq!(config.http.port, 8990);
    }

    #[test]
    fn test_toml_roundtrip_preserves_service() {
        let mut config = Config::default();
        config.service.prefer_direct_stream = true;
        let text = toml::to_string_pretty(&config).unwrap();
        let back = Config::from_toml_str(&text).unwrap();
        assert!(back.service.prefer_direct_stream);
    }
}
