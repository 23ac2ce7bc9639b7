//! The training loop.
//!
//! A [`Trainer`] owns the model state for one data directory. Every call to
//! [`Trainer::train`] streams one source file through normalize, encode,
//! partial fit and store, checkpointing on a timer, and writes the final
//! model artifact when the file is exhausted.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    batch_reader::{self, BatchReader},
    cancel::CancellationToken,
    checkpoint::{self, CheckpointManager, Progress, Snapshot, SourceCursor},
    cleaner::{self, CleanMode},
    clusterer::ClusterModel,
    config::TrainingConfig,
    data_dir::DataDir,
    document_store::{DedupPolicy, DocumentStore},
    encoder::FeatureEncoder,
    error::{Error, Result},
    governor::{Pressure, ResourceGovernor},
    normalizer,
    ranker::QueryRanker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Completed,
    Interrupted,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingOutcome {
    pub result: OutcomeKind,
    pub documents_processed: u64,
    pub total_documents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncrementOutcome {
    pub result: OutcomeKind,
    pub new_documents_processed: u64,
}

/// State of one `train` invocation.
#[derive(Debug, Clone)]
pub struct TrainingSession {
    pub source_path: PathBuf,
    pub file_size_bytes: u64,
    pub total_documents: u64,
    pub processed_documents: u64,
    pub batch_size: usize,
    pub started_at: SystemTime,
    pub last_checkpoint: Instant,
    pub interrupted: bool,
}

/// Receives progress after every batch.
pub trait ProgressSink {
    fn start(&mut self, _processed: u64, _total: u64) {}

    fn advance(&mut self, processed: u64, total: u64);

    fn finish(&mut self) {}
}

/// Discards progress reports.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn advance(&mut self, _processed: u64, _total: u64) {}
}

pub struct Trainer {
    config: TrainingConfig,
    encoder: FeatureEncoder,
    clusters: ClusterModel,
    progress: Progress,
    store: DocumentStore,
    checkpoints: CheckpointManager,
    model_path: PathBuf,
    governor: ResourceGovernor,
    sink: Box<dyn ProgressSink>,
    restored: bool,
}

impl Trainer {
    /// Open the stores under `data_dir`. Saved state is loaded lazily by the
    /// first operation that needs it.
    pub fn open(data_dir: &DataDir, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let dedup = if config.dedup {
            DedupPolicy::SkipExisting
        } else {
            DedupPolicy::Allow
        };
        let store =
            DocumentStore::open(&data_dir.documents_db())?.with_dedup(dedup);
        let checkpoints = CheckpointManager::new(
            &data_dir.checkpoints_dir()?,
            config.max_checkpoints,
        )?;

        Ok(Self {
            encoder: FeatureEncoder::new(config.n_features)?,
            clusters: ClusterModel::new(config.n_clusters, config.n_features)?,
            progress: fresh_progress(&config),
            config,
            store,
            checkpoints,
            model_path: data_dir.model_file(),
            governor: ResourceGovernor::new(),
            sink: Box::new(NoProgress),
            restored: false,
        })
    }

    pub fn with_governor(mut self, governor: ResourceGovernor) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_progress(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn encoder(&self) -> &FeatureEncoder {
        &self.encoder
    }

    pub fn clusters(&self) -> &ClusterModel {
        &self.clusters
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn processed_documents(&self) -> u64 {
        self.progress.processed_documents
    }

    pub fn is_trained(&self) -> bool {
        self.progress.processed_documents > 0
    }

    /// A ranker over the current in-memory model.
    pub fn ranker(&self) -> QueryRanker<'_> {
        QueryRanker::new(
            self.encoder,
            &self.clusters,
            self.progress.processed_documents,
            &self.store,
        )
    }

    /// Pure-data copy of the state that checkpoints persist.
    pub fn snapshot(&self, sequence: u64) -> Snapshot {
        Snapshot {
            sequence,
            encoder: self.encoder,
            clusters: self.clusters.clone(),
            progress: self.progress.clone(),
        }
    }

    /// Replace the in-memory state with `snapshot`.
    ///
    /// The snapshot's encoder width and cluster count win over the
    /// configuration, since a lineage cannot change them.
    pub fn restore(&mut self, snapshot: Snapshot) {
        if snapshot.encoder.n_features() != self.config.n_features
            || snapshot.clusters.n_clusters() != self.config.n_clusters
        {
            warn!(
                n_features = snapshot.encoder.n_features(),
                n_clusters = snapshot.clusters.n_clusters(),
                "saved model shape differs from configuration, keeping saved"
            );
        }
        self.encoder = snapshot.encoder;
        self.clusters = snapshot.clusters;
        self.progress = snapshot.progress;
        self.restored = true;
    }

    /// Load the newest saved state once; later calls are no-ops.
    pub fn restore_latest(&mut self) -> Result<bool> {
        if self.restored {
            return Ok(false);
        }
        self.restored = true;
        let newest =
            checkpoint::load_newest_state(&self.model_path, &self.checkpoints)?;
        match newest {
            Some(snapshot) => {
                info!(
                    processed = snapshot.progress.processed_documents,
                    "resuming from saved state"
                );
                self.restore(snapshot);
                Ok(true)
            }
            None => {
                info!("no saved state, starting fresh");
                Ok(false)
            }
        }
    }

    /// Write a numbered checkpoint of the current state.
    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let sequence = self.checkpoints.next_sequence()?;
        self.checkpoints.save(&self.snapshot(sequence))
    }

    /// Write the final model artifact.
    pub fn save_model(&self) -> Result<PathBuf> {
        checkpoint::write_snapshot(&self.model_path, &self.snapshot(0))?;
        info!(path = %self.model_path.display(), "model saved");
        Ok(self.model_path.clone())
    }

    /// Train on `source`.
    ///
    /// A missing source is an `Err` and leaves all state untouched. Any
    /// later failure is logged and reported as [`OutcomeKind::Error`].
    pub fn train(
        &mut self,
        source: &Path,
        clean: bool,
        cancel: &CancellationToken,
    ) -> Result<TrainingOutcome> {
        if !source.is_file() {
            return Err(Error::NotFound {
                kind: "dataset",
                name: source.display().to_string(),
            });
        }
        info!(source = %source.display(), clean, "starting training");

        match self.run(source, clean, cancel) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(error = %e, "training failed");
                let outcome = TrainingOutcome {
                    result: OutcomeKind::Error,
                    documents_processed: self.progress.processed_documents,
                    total_documents: self.progress.total_documents,
                };
                self.discard_unsaved_state();
                Ok(outcome)
            }
        }
    }

    /// Train on an additional file, cleaning it first, and report how many
    /// documents it contributed.
    pub fn increment(
        &mut self,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<IncrementOutcome> {
        if !source.is_file() {
            return Err(Error::NotFound {
                kind: "dataset",
                name: source.display().to_string(),
            });
        }
        if let Err(e) = self.restore_latest() {
            error!(error = %e, "could not load saved state");
            return Ok(IncrementOutcome {
                result: OutcomeKind::Error,
                new_documents_processed: 0,
            });
        }

        let before = self.progress.processed_documents;
        let outcome = self.train(source, true, cancel)?;
        let new_documents_processed = match outcome.result {
            OutcomeKind::Error => 0,
            _ => outcome.documents_processed.saturating_sub(before),
        };
        info!(new_documents_processed, "increment finished");
        Ok(IncrementOutcome {
            result: outcome.result,
            new_documents_processed,
        })
    }

    fn run(
        &mut self,
        source: &Path,
        clean: bool,
        cancel: &CancellationToken,
    ) -> Result<TrainingOutcome> {
        let path = self.prepare_source(source, clean)?;
        self.restore_latest()?;
        self.reconcile_store()?;

        let canonical = fs::canonicalize(&path)?;
        let file_size_bytes = fs::metadata(&path)?.len();
        let start_offset = self.begin_pass(&canonical, file_size_bytes)?;

        let mut session = TrainingSession {
            source_path: canonical,
            file_size_bytes,
            total_documents: self.progress.total_documents,
            processed_documents: self.progress.processed_documents,
            batch_size: self.config.batch_size,
            started_at: SystemTime::now(),
            last_checkpoint: Instant::now(),
            interrupted: false,
        };
        info!(
            path = %session.source_path.display(),
            bytes = session.file_size_bytes,
            total = session.total_documents,
            processed = session.processed_documents,
            offset = start_offset,
            "training pass"
        );

        self.sink
            .start(session.processed_documents, session.total_documents);
        let reader = BatchReader::open_at(
            &path,
            self.config.chunk_bytes(),
            start_offset,
        )?;

        for batch in reader {
            if !self.wait_for_capacity(cancel) {
                session.interrupted = true;
                break;
            }

            let added = self.process_batch(&batch.lines)?;
            self.progress.processed_documents += added;
            if let Some(cursor) = self.progress.source.as_mut() {
                cursor.offset = batch.end_offset;
            }
            session.processed_documents = self.progress.processed_documents;
            self.sink
                .advance(session.processed_documents, session.total_documents);

            let since = session.last_checkpoint.elapsed();
            if since >= self.config.checkpoint_interval {
                if let Err(e) = self.save_checkpoint() {
                    error!(error = %e, "checkpoint failed, continuing");
                }
                session.last_checkpoint = Instant::now();
            }
        }
        self.sink.finish();

        let elapsed = session.started_at.elapsed().unwrap_or_default();
        if session.interrupted {
            info!(
                processed = session.processed_documents,
                elapsed_secs = elapsed.as_secs(),
                "training interrupted"
            );
            return Ok(TrainingOutcome {
                result: OutcomeKind::Interrupted,
                documents_processed: session.processed_documents,
                total_documents: session.total_documents,
            });
        }

        if let Some(cursor) = self.progress.source.as_mut() {
            cursor.completed = true;
        }
        self.save_model()?;
        info!(
            processed = session.processed_documents,
            elapsed_secs = elapsed.as_secs(),
            "training completed"
        );
        Ok(TrainingOutcome {
            result: OutcomeKind::Completed,
            documents_processed: session.processed_documents,
            total_documents: session.total_documents,
        })
    }

    /// Pick the file to read: a freshly cleaned sidecar, an existing one, or
    /// the source itself.
    fn prepare_source(&self, source: &Path, clean: bool) -> Result<PathBuf> {
        let sidecar = cleaner::sidecar_path(source);
        if clean {
            let outcome = cleaner::clean_dataset(source, CleanMode::Sidecar);
            return match (outcome.success, outcome.output_file) {
                (true, Some(path)) => Ok(path),
                _ => Err(Error::Config(format!(
                    "cleaning {} failed: {}",
                    source.display(),
                    outcome.error.unwrap_or_default()
                ))),
            };
        }
        if sidecar.is_file() {
            info!(path = %sidecar.display(), "using existing cleaned dataset");
            return Ok(sidecar);
        }
        Ok(source.to_path_buf())
    }

    /// Set up the cursor for `path` and return the byte offset to start at.
    fn begin_pass(&mut self, path: &Path, size: u64) -> Result<u64> {
        if let Some(cursor) = &self.progress.source
            && cursor.path == path
            && cursor.size == size
            && !cursor.completed
        {
            info!(offset = cursor.offset, "resuming unfinished pass");
            return Ok(cursor.offset);
        }

        let lines = batch_reader::count_lines(path)?;
        let base_documents = self.progress.processed_documents;
        self.progress.total_documents = base_documents + lines;
        self.progress.batch_size = self.config.batch_size;
        self.progress.source = Some(SourceCursor {
            path: path.to_path_buf(),
            size,
            offset: 0,
            base_documents,
            completed: false,
        });
        Ok(0)
    }

    /// Forget in-memory state that may be ahead of the store or the saved
    /// files, such as a batch fitted but never stored. The next operation
    /// reloads the newest saved state.
    fn discard_unsaved_state(&mut self) {
        self.restored = false;
        self.progress = fresh_progress(&self.config);
        match (
            FeatureEncoder::new(self.config.n_features),
            ClusterModel::new(self.config.n_clusters, self.config.n_features),
        ) {
            (Ok(encoder), Ok(clusters)) => {
                self.encoder = encoder;
                self.clusters = clusters;
            }
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "could not reset model state");
            }
        }
        debug!("discarded unsaved training state");
    }

    /// Drop documents stored after the restored state was taken, so that
    /// replayed batches are not stored twice.
    fn reconcile_store(&mut self) -> Result<()> {
        let keep = self.progress.stored_documents;
        let removed = self.store.truncate(keep)?;
        if removed > 0 {
            warn!(removed, keep, "discarded documents past the saved state");
        }
        Ok(())
    }

    /// Block while memory is tight. Returns `false` if cancelled first.
    fn wait_for_capacity(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match self.governor.check_pressure() {
                Pressure::Allow => return true,
                Pressure::Pause => debug!("retrying batch after pause"),
            }
        }
    }

    fn process_batch(&mut self, lines: &[String]) -> Result<u64> {
        let documents = normalizer::normalize_batch(lines);
        if documents.is_empty() {
            return Ok(0);
        }
        let vectors = self.encoder.encode_batch(&documents);
        let assignments = self.clusters.partial_fit(&vectors)?;
        let ids = self.store.append_with_clusters(&documents, &assignments)?;
        if let Some(&last) = ids.iter().max() {
            self.progress.stored_documents =
                self.progress.stored_documents.max(last);
        }
        debug!(documents = documents.len(), "processed batch");
        Ok(documents.len() as u64)
    }
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("config", &self.config)
            .field("progress", &self.progress)
            .field("restored", &self.restored)
            .finish_non_exhaustive()
    }
}

fn fresh_progress(config: &TrainingConfig) -> Progress {
    Progress {
        processed_documents: 0,
        stored_documents: 0,
        total_documents: 0,
        batch_size: config.batch_size,
        started_at: unix_now(),
        source: None,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
