//! On-disk layout of one training lineage.
//!
//! ```text
//! <root>/
//!   config.redb       persisted training settings
//!   documents.redb    normalized documents and cluster membership
//!   model.bin         snapshot written when a pass completes
//!   checkpoints/      numbered snapshots taken during a pass
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "STREAMRANK_DATA_DIR";

/// Root of a lineage; every path the trainer and the CLI touch hangs off it.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Pick the lineage root and create it if needed. `--data-dir` wins over
    /// `STREAMRANK_DATA_DIR`, which wins over `$XDG_DATA_HOME/streamrank`.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("streamrank")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Settings read by `TrainingConfig::resolve`.
    pub fn config_db(&self) -> PathBuf {
        self.root.join("config.redb")
    }

    /// Store shared by training and querying.
    pub fn documents_db(&self) -> PathBuf {
        self.root.join("documents.redb")
    }

    /// Snapshot of a completed pass. Queries prefer it over an older
    /// checkpoint.
    pub fn model_file(&self) -> PathBuf {
        self.root.join("model.bin")
    }

    /// Directory of `checkpoint_<seq>.ckpt` files, created on first use.
    pub fn checkpoints_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("checkpoints");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }
}
