//! Application configuration.
//!
//! Values are merged from an optional TOML file (path from `MARKETFLOW_CONFIG`,
//! default `marketflow.toml`) and then raw environment variables, so
//! `REFRESH_INTERVAL=2m` overrides `refresh_interval = "5m"` in the file.

use crate::market::Segment;
use crate::refresh::AggregatorSettings;
use anyhow::{Context, bail};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

pub const CONFIG_PATH_VAR: &str = "MARKETFLOW_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "marketflow.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Level for this crate's own log targets; dependencies stay at `warn`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// PostgreSQL connection string. Persistence is disabled when absent.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_refresh_interval", deserialize_with = "duration")]
    pub refresh_interval: Duration,
    #[serde(default = "default_fetch_timeout", deserialize_with = "duration")]
    pub fetch_timeout: Duration,
    #[serde(default = "default_cycle_deadline", deserialize_with = "duration")]
    pub cycle_deadline: Duration,
    /// Grace period for in-flight work at shutdown.
    #[serde(default = "default_shutdown_timeout", deserialize_with = "duration")]
    pub shutdown_timeout: Duration,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default = "default_persist_batch_size")]
    pub persist_batch_size: usize,
    #[serde(default = "default_segments")]
    pub segments: Vec<Segment>,
}

impl Config {
    /// Load from the file named by `MARKETFLOW_CONFIG` (if present) and the environment.
    pub fn load() -> anyhow::Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        let config: Config = Self::figment(&path)
            .extract()
            .with_context(|| format!("Failed to load config (file: {path})"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::raw().ignore(&[CONFIG_PATH_VAR]))
    }

    /// Reject configurations the refresh pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.segments.is_empty() {
            bail!("at least one segment must be configured");
        }

        let mut ids = HashSet::new();
        for segment in &self.segments {
            if segment.id.trim().is_empty() {
                bail!("segment ids must not be empty");
            }
            if !ids.insert(segment.id.to_ascii_lowercase()) {
                bail!("duplicate segment id '{}'", segment.id);
            }
            if segment.code_prefix.is_empty() {
                bail!("segment '{}' has an empty code prefix", segment.id);
            }
        }

        if self.refresh_interval.is_zero() {
            bail!("refresh_interval must be greater than zero");
        }
        if self.cycle_deadline < self.fetch_timeout {
            warn!(
                fetch_timeout = ?self.fetch_timeout,
                cycle_deadline = ?self.cycle_deadline,
                "Cycle deadline is shorter than the per-fetch timeout"
            );
        }
        Ok(())
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            fetch_timeout: self.fetch_timeout,
            cycle_deadline: self.cycle_deadline,
            max_concurrent_fetches: self.max_concurrent_fetches,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            port: default_port(),
            database_url: None,
            refresh_interval: default_refresh_interval(),
            fetch_timeout: default_fetch_timeout(),
            cycle_deadline: default_cycle_deadline(),
            shutdown_timeout: default_shutdown_timeout(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            persist_batch_size: default_persist_batch_size(),
            segments: default_segments(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_cycle_deadline() -> Duration {
    Duration::from_secs(20)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_persist_batch_size() -> usize {
    crate::data::persistence::DEFAULT_BATCH_SIZE
}

fn default_segments() -> Vec<Segment> {
    vec![
        Segment::new("main", "Main Board", "MB", 25),
        Segment::new("growth", "Growth Board", "GB", 20),
        Segment::new("innovation", "Innovation Tier", "IT", 15),
        Segment::new("basic", "Basic Tier", "BT", 10),
    ]
}

/// Parse a duration from a bare number of seconds or a string like `"5m"`,
/// `"8s"` or `"750ms"`.
fn duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let parser = DurationParser::with_time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ]);
    let parsed = parser
        .parse(text.trim())
        .map_err(|e| format!("invalid duration '{text}': {e}"))?;
    Duration::try_from(parsed).map_err(|e| format!("invalid duration '{text}': {e}"))
}
