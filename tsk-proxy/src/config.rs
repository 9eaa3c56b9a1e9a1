//! Proxy configuration file loading.
//!
//! A flat key:value YAML document. Grounded on `cognitod/src/config.rs`'s
//! `Config` struct: `#[serde(default = "fn")]` for optional fields, a
//! `load()` that reads a path, and every required field a bare
//! `String`/`u64` so a missing key fails deserialization rather than
//! silently defaulting — missing values are a fatal configuration error.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

const DEFAULT_STATS_INTERVAL: u64 = 60;
const MAX_FILTER_PREFIXES: usize = 1024;

fn default_log_level() -> u8 {
    0
}

fn default_stats_interval() -> u64 {
    DEFAULT_STATS_INTERVAL
}

fn default_filter_prefix() -> Vec<String> {
    Vec::new()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("filter-prefix lists more than {MAX_FILTER_PREFIXES} entries ({0})")]
    TooManyFilters(usize),
}

/// Every field without a `default` is required; a missing value is a fatal
/// configuration error.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "log-level", default = "default_log_level")]
    pub log_level: u8,

    #[serde(rename = "filter-prefix", default = "default_filter_prefix")]
    pub filter_prefix: Vec<String>,

    #[serde(rename = "timeseries-backend")]
    pub timeseries_backend: String,

    #[serde(rename = "timeseries-dbats-opts")]
    pub timeseries_dbats_opts: String,

    #[serde(rename = "kafka-brokers")]
    pub kafka_brokers: String,

    #[serde(rename = "kafka-topic-prefix")]
    pub kafka_topic_prefix: String,

    #[serde(rename = "kafka-channel")]
    pub kafka_channel: String,

    #[serde(rename = "kafka-consumer-group")]
    pub kafka_consumer_group: String,

    #[serde(rename = "kafka-offset")]
    pub kafka_offset: String,

    #[serde(rename = "stats-interval", default = "default_stats_interval")]
    pub stats_interval: u64,

    #[serde(rename = "stats-ts-backend")]
    pub stats_ts_backend: String,

    #[serde(rename = "stats-ts-opts")]
    pub stats_ts_opts: String,
}

impl ProxyConfig {
    /// Maps the config file's `log-level` (0-5) onto a `log::LevelFilter`,
    /// the same scale `env_logger` exposes as Off/Error/Warn/Info/Debug/Trace.
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.log_level {
            0 => log::LevelFilter::Off,
            1 => log::LevelFilter::Error,
            2 => log::LevelFilter::Warn,
            3 => log::LevelFilter::Info,
            4 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: ProxyConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        if config.filter_prefix.len() > MAX_FILTER_PREFIXES {
            return Err(ConfigError::TooManyFilters(config.filter_prefix.len()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tsk-proxy.yml");
        std::fs::write(
            &path,
            r#"
timeseries-backend: storage
timeseries-dbats-opts: "-d /var/lib/tsk"
kafka-brokers: "localhost:9092"
kafka-topic-prefix: "tsk-production"
kafka-channel: "main"
kafka-consumer-group: "tsk-proxy"
kafka-offset: "latest"
stats-ts-backend: ascii
stats-ts-opts: "-f /var/log/tsk-proxy-stats.txt"
"#,
        )
        .unwrap();

        let cfg = ProxyConfig::load(&path).unwrap();
        assert_eq!(cfg.log_level, 0);
        assert_eq!(cfg.stats_interval, DEFAULT_STATS_INTERVAL);
        assert!(cfg.filter_prefix.is_empty());
        assert_eq!(cfg.kafka_channel, "main");
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tsk-proxy.yml");
        std::fs::write(&path, "timeseries-backend: storage\n").unwrap();
        assert!(matches!(ProxyConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn level_filter_maps_log_level_scale() {
        let mut cfg = {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("tsk-proxy.yml");
            std::fs::write(
                &path,
                "timeseries-backend: storage\ntimeseries-dbats-opts: x\nkafka-brokers: x\nkafka-topic-prefix: x\nkafka-channel: x\nkafka-consumer-group: x\nkafka-offset: latest\nstats-ts-backend: ascii\nstats-ts-opts: x\n",
            )
            .unwrap();
            ProxyConfig::load(&path).unwrap()
        };
        cfg.log_level = 0;
        assert_eq!(cfg.level_filter(), log::LevelFilter::Off);
        cfg.log_level = 3;
        assert_eq!(cfg.level_filter(), log::LevelFilter::Info);
        cfg.log_level = 99;
        assert_eq!(cfg.level_filter(), log::LevelFilter::Trace);
    }

    #[test]
    fn rejects_too_many_filter_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tsk-proxy.yml");
        let mut doc = String::from(
            "timeseries-backend: storage\ntimeseries-dbats-opts: x\nkafka-brokers: x\nkafka-topic-prefix: x\nkafka-channel: x\nkafka-consumer-group: x\nkafka-offset: latest\nstats-ts-backend: ascii\nstats-ts-opts: x\nfilter-prefix:\n",
        );
        for i in 0..(MAX_FILTER_PREFIXES + 1) {
            doc.push_str(&format!("  - p{i}\n"));
        }
        std::fs::write(&path, doc).unwrap();
        assert!(matches!(
            ProxyConfig::load(&path),
            Err(ConfigError::TooManyFilters(_))
        ));
    }
}
