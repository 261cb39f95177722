//! CLI configuration file.

use color_eyre::eyre::{Result, WrapErr, ensure};
use serde::{Deserialize, Serialize};
use skein_cluster::WorkerConfig;
use skein_runtime::{BackoffPolicy, EngineConfig, IgnorableSignature};
use std::path::Path;
use std::time::Duration;

/// Everything `skein` needs to stand up an engine and its workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeinConfig {
    /// Engine settings
    pub engine: EngineConfig,
    /// Shards to register, all open
    pub shards: Vec<String>,
    /// Workers started on every shard
    pub workers_per_shard: usize,
    /// Worker template; the shard is filled in per worker
    pub worker: WorkerConfig,
}

impl Default for SkeinConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::new()
                .with_backoff(BackoffPolicy::exponential(
                    Duration::from_millis(100),
                    Duration::from_secs(5),
                ))
                .with_ignorable(IgnorableSignature::status(429))
                .with_ignorable(IgnorableSignature::contains("rate limit")),
            shards: vec!["alpha".to_string(), "beta".to_string()],
            workers_per_shard: 2,
            worker: WorkerConfig::default()
                .with_poll_interval(Duration::from_millis(20))
                .with_idle_backoff(Duration::from_millis(250)),
        }
    }
}

impl SkeinConfig {
    /// Load from a JSON file, or use defaults when no path is given
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .wrap_err_with(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns error on an empty shard list, zero workers per shard, or an
    /// invalid engine or worker section
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.shards.is_empty(), "at least one shard is required");
        ensure!(self.workers_per_shard > 0, "workers_per_shard must be at least 1");
        self.engine.throttle().wrap_err("invalid engine config")?;
        for shard in &self.shards {
            self.worker
                .clone()
                .with_shard(shard.as_str())
                .validate()
                .wrap_err_with(|| format!("invalid worker config for shard {}", shard))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SkeinConfig::load(None).unwrap();
        assert_eq!(config.shards, vec!["alpha", "beta"]);
        assert_eq!(config.workers_per_shard, 2);
        assert_eq!(config.engine.ignorable.len(), 2);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"shards": ["binance-futures"], "engine": {{"default_max_attempts": 5}}}}"#
        )
        .unwrap();

        let config = SkeinConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.shards, vec!["binance-futures"]);
        assert_eq!(config.engine.default_max_attempts, 5);
        assert_eq!(config.workers_per_shard, 2);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"workers_per_shard": 0}}"#).unwrap();
        assert!(SkeinConfig::load(Some(file.path())).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"engine": {{"default_max_attempts": 0}}}}"#).unwrap();
        assert!(SkeinConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let missing = Path::new("/definitely/not/here/skein.json");
        assert!(SkeinConfig::load(Some(missing)).is_err());
    }
}
