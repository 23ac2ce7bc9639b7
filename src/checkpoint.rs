//! Durable snapshots of the training state.
//!
//! A snapshot file is laid out as:
//!
//! - 4 bytes: magic `SRCK`
//! - 4 bytes: format version (u32 LE)
//! - 8 bytes: payload length (u64 LE)
//! - payload: bincode-encoded [`Snapshot`]
//! - 32 bytes: blake3 digest of the payload
//!
//! Files are written to a temporary sibling, fsynced and renamed into place,
//! so a reader never observes a partially written snapshot under its final
//! name.

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    clusterer::ClusterModel,
    encoder::FeatureEncoder,
    error::{Error, Result},
};

const MAGIC: &[u8; 4] = b"SRCK";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 16;
const DIGEST_LEN: usize = 32;

const FILE_PREFIX: &str = "checkpoint_";
const FILE_EXTENSION: &str = "ckpt";

/// Where a training pass stands within one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCursor {
    pub path: PathBuf,
    pub size: u64,
    /// Byte offset just past the last fully processed batch.
    pub offset: u64,
    /// Documents that had been processed before this source was started.
    pub base_documents: u64,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub processed_documents: u64,
    /// Highest document id in the store when this state was taken.
    pub stored_documents: u64,
    pub total_documents: u64,
    pub batch_size: usize,
    /// Seconds since the Unix epoch at which the lineage started training.
    pub started_at: u64,
    pub source: Option<SourceCursor>,
}

/// Everything needed to resume training or answer queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequence: u64,
    pub encoder: FeatureEncoder,
    pub clusters: ClusterModel,
    pub progress: Progress,
}

/// A checkpoint file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFile {
    pub sequence: u64,
    pub path: PathBuf,
    pub size: u64,
}

/// Serialize `snapshot` to `path` atomically.
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let payload =
        bincode::serde::encode_to_vec(snapshot, bincode::config::standard())?;
    let digest = blake3::hash(&payload);

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + DIGEST_LEN);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&payload);
    bytes.extend_from_slice(digest.as_bytes());

    let tmp = temp_path(path);
    let written = write_and_sync(&tmp, &bytes).and_then(|()| {
        fs::rename(&tmp, path)?;
        Ok(())
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    #[cfg(unix)]
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    debug!(
        path = %path.display(),
        bytes = bytes.len(),
        sequence = snapshot.sequence,
        "wrote snapshot"
    );
    Ok(())
}

/// Read and fully validate a snapshot file.
pub fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let corrupt = |reason: &str| Error::CorruptCheckpoint {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let bytes = fs::read(path)?;
    if bytes.len() < HEADER_LEN + DIGEST_LEN {
        return Err(corrupt("file too short"));
    }
    if &bytes[0..4] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported format version {version}")));
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[8..HEADER_LEN]);
    let len = u64::from_le_bytes(len);
    if len != (bytes.len() - HEADER_LEN - DIGEST_LEN) as u64 {
        return Err(corrupt("payload length does not match file size"));
    }

    let payload = &bytes[HEADER_LEN..bytes.len() - DIGEST_LEN];
    let digest = &bytes[bytes.len() - DIGEST_LEN..];
    if blake3::hash(payload).as_bytes().as_slice() != digest {
        return Err(corrupt("digest mismatch"));
    }

    let (snapshot, _): (Snapshot, usize) = bincode::serde::decode_from_slice(
        payload,
        bincode::config::standard(),
    )?;
    snapshot.encoder.check_compatible()?;
    Ok(snapshot)
}

/// Cheap check before a full read: non-empty with readable first and last
/// bytes.
pub fn verify_integrity(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size == 0 {
        return Err(Error::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason: "empty file".into(),
        });
    }
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte)?;
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut byte)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Numbered checkpoints in one directory, oldest pruned beyond a limit.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    /// Zero keeps every checkpoint.
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(dir: &Path, max_checkpoints: usize) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|_| Error::DataDir(dir.to_path_buf()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_checkpoints,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, sequence: u64) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{sequence}.{FILE_EXTENSION}"))
    }

    /// Checkpoint files on disk, by ascending sequence number.
    pub fn list(&self) -> Result<Vec<CheckpointFile>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(sequence) = name.to_str().and_then(parse_sequence) else {
                continue;
            };
            files.push(CheckpointFile {
                sequence,
                path: entry.path(),
                size: entry.metadata()?.len(),
            });
        }
        files.sort_by_key(|f| f.sequence);
        Ok(files)
    }

    /// Sequence number the next checkpoint should use.
    pub fn next_sequence(&self) -> Result<u64> {
        Ok(self.list()?.last().map_or(1, |f| f.sequence + 1))
    }

    /// Write `snapshot` under its sequence number, then prune.
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let path = self.path_for(snapshot.sequence);
        write_snapshot(&path, snapshot)?;
        info!(
            path = %path.display(),
            sequence = snapshot.sequence,
            processed = snapshot.progress.processed_documents,
            "checkpoint saved"
        );
        self.prune()?;
        Ok(path)
    }

    /// Delete the oldest checkpoints beyond the retention limit.
    pub fn prune(&self) -> Result<usize> {
        if self.max_checkpoints == 0 {
            return Ok(0);
        }
        let files = self.list()?;
        let excess = files.len().saturating_sub(self.max_checkpoints);
        for file in &files[..excess] {
            match fs::remove_file(&file.path) {
                Ok(()) => debug!(
                    path = %file.path.display(),
                    "pruned old checkpoint"
                ),
                Err(e) => warn!(
                    path = %file.path.display(),
                    error = %e,
                    "failed to prune checkpoint"
                ),
            }
        }
        Ok(excess)
    }

    /// Newest checkpoint that passes validation, falling back to older ones.
    pub fn load_latest(&self) -> Result<Option<(Snapshot, CheckpointFile)>> {
        let files = self.list()?;
        if files.is_empty() {
            return Ok(None);
        }

        for file in files.iter().rev() {
            let loaded = verify_integrity(&file.path)
                .and_then(|()| read_snapshot(&file.path));
            match loaded {
                Ok(snapshot) => {
                    info!(
                        path = %file.path.display(),
                        sequence = file.sequence,
                        processed = snapshot.progress.processed_documents,
                        "loaded checkpoint"
                    );
                    return Ok(Some((snapshot, file.clone())));
                }
                Err(e) => warn!(
                    path = %file.path.display(),
                    error = %e,
                    "skipping unusable checkpoint"
                ),
            }
        }

        warn!(
            dir = %self.dir.display(),
            candidates = files.len(),
            "no usable checkpoint"
        );
        Ok(None)
    }
}

/// The more advanced of the final model artifact and the newest usable
/// checkpoint, by processed document count. An unreadable model artifact is
/// logged and ignored.
pub fn load_newest_state(
    model_path: &Path,
    checkpoints: &CheckpointManager,
) -> Result<Option<Snapshot>> {
    let model = if model_path.exists() {
        match read_snapshot(model_path) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(
                    path = %model_path.display(),
                    error = %e,
                    "ignoring unreadable model file"
                );
                None
            }
        }
    } else {
        None
    };
    let checkpoint = checkpoints.load_latest()?.map(|(snapshot, _)| snapshot);

    Ok(match (model, checkpoint) {
        (Some(m), Some(c))
            if c.progress.processed_documents
                > m.progress.processed_documents =>
        {
            Some(c)
        }
        (Some(m), _) => Some(m),
        (None, c) => c,
    })
}

fn parse_sequence(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}
