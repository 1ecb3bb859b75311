pub mod agents;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub use agents::{AgentSettings, AgentSettingsError, AgentsConfig, ReceiverSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_pmode_directory")]
    pub pmode_directory: PathBuf,
    #[serde(default)]
    pub agents_path: Option<PathBuf>,
    #[serde(default)]
    pub keyring_path: Option<PathBuf>,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub pmode_watch: PModeWatchConfig,
    #[serde(default = "default_drain_timeout", with = "humantime_serde_compat")]
    pub drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pmode_directory: default_pmode_directory(),
            agents_path: None,
            keyring_path: None,
            database: None,
            pmode_watch: PModeWatchConfig::default(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub acquire_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PModeWatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_watch_interval", with = "humantime_serde_compat")]
    pub poll_interval: Duration,
}

impl Default for PModeWatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: default_watch_interval(),
        }
    }
}

fn default_pmode_directory() -> PathBuf {
    PathBuf::from("config/pmodes")
}

const fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_watch_interval() -> Duration {
    Duration::from_secs(2)
}

const fn default_true() -> bool {
    true
}

impl EngineConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/as4").required(false))
            .add_source(Environment::with_prefix("AS4").separator("__"))
            .build()?
            .try_deserialize()
    }
}

/// Durations as humantime text (`"5s"`) or integer milliseconds.
mod humantime_serde_compat {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(millis) => Ok(Duration::from_millis(millis)),
            Raw::Text(text) => match text.trim().parse::<u64>() {
                Ok(millis) => Ok(Duration::from_millis(millis)),
                Err(_) => humantime::parse_duration(text.trim()).map_err(D::Error::custom),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(source: &str) -> EngineConfig {
        Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn empty_source_uses_defaults() {
        let config = from_toml("");
        assert_eq!(config.pmode_directory, PathBuf::from("config/pmodes"));
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert!(config.pmode_watch.enabled);
        assert!(config.database.is_none());
    }

    #[test]
    fn durations_accept_text_and_millis() {
        let config = from_toml(
            r#"
drain_timeout = "30s"
agents_path = "config/agents.yaml"

[pmode_watch]
poll_interval = 250
"#,
        );
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.pmode_watch.poll_interval, Duration::from_millis(250));
        assert_eq!(config.agents_path, Some(PathBuf::from("config/agents.yaml")));
    }
}
