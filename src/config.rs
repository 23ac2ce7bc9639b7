//! Training parameters and their persisted overrides.
//!
//! Values are resolved from the `settings` table of [`ConfigDb`], falling back
//! to the defaults below. Command-line flags may override individual fields
//! afterwards.

use std::time::Duration;

use crate::{
    config_db::ConfigDb,
    error::{Error, Result},
};

pub const DEFAULT_N_CLUSTERS: usize = 300;
pub const DEFAULT_BATCH_SIZE: usize = 100_000;
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 10_800;
pub const DEFAULT_MAX_CHECKPOINTS: usize = 3;
pub const DEFAULT_N_FEATURES: usize = 1 << 18;

/// Average bytes budgeted per document when sizing a read window.
pub const BYTES_PER_DOCUMENT: usize = 100;

/// Setting keys understood by [`TrainingConfig::resolve`].
pub mod keys {
    pub const N_CLUSTERS: &str = "n_clusters";
    pub const BATCH_SIZE: &str = "batch_size";
    pub const CHECKPOINT_INTERVAL_SECS: &str = "checkpoint_interval_secs";
    pub const MAX_CHECKPOINTS: &str = "max_checkpoints";
    pub const N_FEATURES: &str = "n_features";
    pub const DEDUP: &str = "dedup";

    pub const ALL: &[&str] = &[
        N_CLUSTERS,
        BATCH_SIZE,
        CHECKPOINT_INTERVAL_SECS,
        MAX_CHECKPOINTS,
        N_FEATURES,
        DEDUP,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingConfig {
    pub n_clusters: usize,
    pub batch_size: usize,
    pub checkpoint_interval: Duration,
    /// Number of checkpoints kept on disk. Zero keeps all of them.
    pub max_checkpoints: usize,
    pub n_features: usize,
    /// Skip documents whose content is already stored.
    pub dedup: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            n_clusters: DEFAULT_N_CLUSTERS,
            batch_size: DEFAULT_BATCH_SIZE,
            checkpoint_interval: Duration::from_secs(
                DEFAULT_CHECKPOINT_INTERVAL_SECS,
            ),
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
            n_features: DEFAULT_N_FEATURES,
            dedup: false,
        }
    }
}

impl TrainingConfig {
    /// Build a configuration from stored settings, using defaults for
    /// anything unset.
    pub fn resolve(config_db: &ConfigDb) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            n_clusters: read(config_db, keys::N_CLUSTERS, defaults.n_clusters)?,
            batch_size: read(config_db, keys::BATCH_SIZE, defaults.batch_size)?,
            checkpoint_interval: Duration::from_secs(read(
                config_db,
                keys::CHECKPOINT_INTERVAL_SECS,
                DEFAULT_CHECKPOINT_INTERVAL_SECS,
            )?),
            max_checkpoints: read(
                config_db,
                keys::MAX_CHECKPOINTS,
                defaults.max_checkpoints,
            )?,
            n_features: read(config_db, keys::N_FEATURES, defaults.n_features)?,
            dedup: read(config_db, keys::DEDUP, defaults.dedup)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_clusters == 0 {
            return Err(Error::Config("n_clusters must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.n_features == 0 || self.n_features > u32::MAX as usize {
            return Err(Error::Config(format!(
                "n_features must be between 1 and {}",
                u32::MAX
            )));
        }
        Ok(())
    }

    /// Size in bytes of one memory-mapped read window.
    pub fn chunk_bytes(&self) -> usize {
        self.batch_size.saturating_mul(BYTES_PER_DOCUMENT)
    }
}

/// Check that `key` is a known setting and `value` parses for it.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    let ok = match key {
        keys::DEDUP => value.parse::<bool>().is_ok(),
        keys::CHECKPOINT_INTERVAL_SECS => value.parse::<u64>().is_ok(),
        k if keys::ALL.contains(&k) => value.parse::<usize>().is_ok(),
        _ => {
            return Err(Error::NotFound {
                kind: "setting",
                name: key.to_string(),
            });
        }
    };
    if ok {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid value for {key}: {value:?}")))
    }
}

fn read<T>(config_db: &ConfigDb, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match config_db.get_setting(key)? {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            Error::Config(format!("invalid value for {key}: {raw:?}"))
        }),
    }
}
