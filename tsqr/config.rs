//! Job settings that can live in a TOML file next to the data. Every field is optional;
//! command-line flags override file values and file values override the defaults.

use crate::types::{BlockFactor, KeyPolicy};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    /// Comma-separated reducer fan-ins, validated when the job is built.
    pub reduce_schedule: Option<String>,
    pub block_size: Option<BlockFactor>,
    /// Minimum partition size in bytes.
    pub split_size: Option<u64>,
    /// Per-task memory hint in bytes.
    pub mem: Option<u64>,
    pub key_policy: Option<KeyPolicy>,
    pub seed: Option<u64>,
    pub threads: Option<usize>,
}

impl JobConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Fields set in `overrides` win; unset ones fall back to `self`.
    pub fn overridden_by(self, overrides: JobConfig) -> JobConfig {
        JobConfig {
            reduce_schedule: overrides.reduce_schedule.or(self.reduce_schedule),
            block_size: overrides.block_size.or(self.block_size),
            split_size: overrides.split_size.or(self.split_size),
            mem: overrides.mem.or(self.mem),
            key_policy: overrides.key_policy.or(self.key_policy),
            seed: overrides.seed.or(self.seed),
            threads: overrides.threads.or(self.threads),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_partial_files() {
        let config = JobConfig::from_toml(
            r#"
reduce_schedule = "40,10,1"
block_size = 5
key_policy = "round_robin"
"#,
        )
        .unwrap();
        assert_eq!(config.reduce_schedule.as_deref(), Some("40,10,1"));
        assert_eq!(config.block_size, Some(BlockFactor::new(5).unwrap()));
        assert_eq!(config.key_policy, Some(KeyPolicy::RoundRobin));
        assert_eq!(config.split_size, None);
    }

    #[test]
    fn rejects_bad_values_and_unknown_keys() {
        assert!(matches!(
            JobConfig::from_toml("block_size = 1"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            JobConfig::from_toml("reducers = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn overrides_take_precedence() {
        let file = JobConfig {
            reduce_schedule: Some("4,1".into()),
            mem: Some(1 << 20),
            ..JobConfig::default()
        };
        let flags = JobConfig {
            reduce_schedule: Some("1".into()),
            seed: Some(3),
            ..JobConfig::default()
        };
        let merged = file.overridden_by(flags);
        assert_eq!(merged.reduce_schedule.as_deref(), Some("1"));
        assert_eq!(merged.mem, Some(1 << 20));
        assert_eq!(merged.seed, Some(3));
    }

    #[test]
    fn job_files_load_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.toml");
        fs::write(&path, "block_size = 4\nthreads = 2\n").unwrap();
        let config = JobConfig {
            block_size: Some(BlockFactor::new(4).unwrap()),
            threads: Some(2),
            ..JobConfig::default()
        };
        assert_eq!(JobConfig::load(&path).unwrap(), config);
        assert!(matches!(
            JobConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
