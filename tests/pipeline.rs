//! End-to-end behaviour of the training and query pipeline.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use streamrank::{
    CancellationToken,
    CheckpointManager,
    DataDir,
    QueryRanker,
    ResourceGovernor,
    Trainer,
    checkpoint,
    config::TrainingConfig,
    governor::MemoryProbe,
    ranker::TOP_K,
    trainer::{OutcomeKind, ProgressSink},
};

type Reports = Arc<Mutex<Vec<(u64, u64)>>>;

/// Memory probe replaying a script; the last value repeats.
struct Scripted(Vec<f64>);

impl MemoryProbe for Scripted {
    fn used_percent(&mut self) -> streamrank::Result<f64> {
        if self.0.len() > 1 {
            Ok(self.0.remove(0))
        } else {
            Ok(self.0[0])
        }
    }
}

/// Records every progress report, optionally cancelling after the n-th.
struct Recorder {
    reports: Reports,
    cancel: Option<(CancellationToken, usize)>,
}

impl ProgressSink for Recorder {
    fn advance(&mut self, processed: u64, total: u64) {
        let mut reports = self.reports.lock().unwrap();
        reports.push((processed, total));
        if let Some((token, after)) = &self.cancel
            && reports.len() == *after
        {
            token.cancel();
        }
    }
}

fn config(batch_size: usize) -> TrainingConfig {
    TrainingConfig {
        n_clusters: 3,
        batch_size,
        checkpoint_interval: Duration::from_secs(3600),
        max_checkpoints: 0,
        n_features: 1 << 12,
        dedup: false,
    }
}

fn data_dir(tmp: &tempfile::TempDir) -> DataDir {
    DataDir::resolve(Some(&tmp.path().join("data"))).unwrap()
}

fn calm() -> ResourceGovernor {
    ResourceGovernor::with_probe(Box::new(Scripted(vec![20.0])))
}

fn open(tmp: &tempfile::TempDir, config: TrainingConfig) -> Trainer {
    Trainer::open(&data_dir(tmp), config)
        .unwrap()
        .with_governor(calm())
}

/// `count` lines, each padded to exactly `width` bytes including the newline.
fn fixed_width_corpus(
    tmp: &tempfile::TempDir,
    count: usize,
    width: usize,
) -> PathBuf {
    let topics = ["rivers and lakes", "stars and planets", "bread and cheese"];
    let text: String = (0..count)
        .map(|i| {
            let line = format!("entry {i} about {}", topics[i % 3]);
            format!("{line:<w$}\n", w = width - 1)
        })
        .collect();
    let path = tmp.path().join("corpus.txt");
    fs::write(&path, text).unwrap();
    path
}

fn assert_bounded(reports: &[(u64, u64)]) {
    for &(processed, total) in reports {
        assert!(processed <= total, "{processed} > {total}");
    }
    for pair in reports.windows(2) {
        assert!(pair[0].0 <= pair[1].0);
    }
}

#[test]
fn three_line_file_counts_non_blank_documents() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("tiny.txt");
    fs::write(&source, "Hello world\n\nFoo bar!\n").unwrap();

    let mut trainer = open(&tmp, config(100_000));
    let outcome = trainer
        .train(&source, false, &CancellationToken::new())
        .unwrap();

    assert_eq!(outcome.result, OutcomeKind::Completed);
    assert_eq!(outcome.documents_processed, 2);
    assert_eq!(outcome.total_documents, 3);

    let store = trainer.store();
    assert_eq!(store.len().unwrap(), 2);
    assert_eq!(store.get(1).unwrap().as_deref(), Some("hello world"));
    assert_eq!(store.get(2).unwrap().as_deref(), Some("foo bar"));
    assert!(tmp.path().join("data/model.bin").exists());
}

#[test]
fn line_longer_than_a_batch_window_is_one_document() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("long.txt");
    // Over twice the 100-byte window of a one-document batch.
    let line = format!("{} café", "word more ".repeat(25));
    fs::write(&source, format!("{line}\nshort line\n")).unwrap();

    let reports: Reports = Arc::default();
    let mut trainer = open(&tmp, config(1)).with_progress(Box::new(Recorder {
        reports: Arc::clone(&reports),
        cancel: None,
    }));
    let outcome = trainer
        .train(&source, false, &CancellationToken::new())
        .unwrap();

    assert_eq!(outcome.result, OutcomeKind::Completed);
    assert_eq!(outcome.documents_processed, 2);
    assert_eq!(outcome.total_documents, 2);
    assert_eq!(trainer.store().len().unwrap(), 2);
    let first = trainer.store().get(1).unwrap().unwrap();
    assert!(first.starts_with("word more word"));
    assert!(first.ends_with("more café"), "{first}");
    assert_eq!(trainer.store().get(2).unwrap().as_deref(), Some("short line"));
    assert_bounded(&reports.lock().unwrap());
}

#[test]
fn interruption_keeps_exactly_the_finished_batches() {
    let tmp = tempfile::tempdir().unwrap();
    // 100-byte windows over 50-byte lines: two lines per batch, ten batches.
    let source = fixed_width_corpus(&tmp, 20, 50);

    let cancel = CancellationToken::new();
    let reports: Reports = Arc::default();
    let mut trainer = open(&tmp, config(1)).with_progress(Box::new(Recorder {
        reports: Arc::clone(&reports),
        cancel: Some((cancel.clone(), 3)),
    }));

    let outcome = trainer.train(&source, false, &cancel).unwrap();
    assert_eq!(outcome.result, OutcomeKind::Interrupted);
    assert_eq!(outcome.documents_processed, 6);
    assert_eq!(outcome.total_documents, 20);
    assert_eq!(trainer.store().len().unwrap(), 6);
    assert_eq!(
        trainer.store().get(6).unwrap().as_deref(),
        Some("entry 5 about bread and cheese")
    );
    assert!(!tmp.path().join("data/model.bin").exists());

    // Running again picks up at batch 4.
    let outcome = trainer
        .train(&source, false, &CancellationToken::new())
        .unwrap();
    assert_eq!(outcome.result, OutcomeKind::Completed);
    assert_eq!(outcome.documents_processed, 20);
    assert_eq!(outcome.total_documents, 20);
    assert_eq!(trainer.store().len().unwrap(), 20);

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 10);
    assert_eq!(reports[2], (6, 20));
    assert_eq!(reports[3], (8, 20));
    assert_eq!(reports[9], (20, 20));
    assert_bounded(&reports);
}

#[test]
fn memory_pressure_pauses_and_retries_the_same_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("tiny.txt");
    fs::write(&source, "Hello world\n\nFoo bar!\n").unwrap();

    let slept = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&slept);
    let governor =
        ResourceGovernor::with_probe(Box::new(Scripted(vec![95.0, 40.0])))
            .with_sleeper(move |d| log.lock().unwrap().push(d));

    let reports: Reports = Arc::default();
    let mut trainer = Trainer::open(&data_dir(&tmp), config(100_000))
        .unwrap()
        .with_governor(governor)
        .with_progress(Box::new(Recorder {
            reports: Arc::clone(&reports),
            cancel: None,
        }));

    let outcome = trainer
        .train(&source, false, &CancellationToken::new())
        .unwrap();

    assert_eq!(*slept.lock().unwrap(), vec![Duration::from_secs(60)]);
    assert_eq!(outcome.result, OutcomeKind::Completed);
    assert_eq!(outcome.documents_processed, 2);
    assert_eq!(trainer.store().len().unwrap(), 2);
    assert_eq!(*reports.lock().unwrap(), vec![(2, 3)]);
}

#[test]
fn corrupt_newest_checkpoints_fall_back_and_resume() {
    let tmp = tempfile::tempdir().unwrap();
    // 60-byte lines in 100-byte windows: one document per batch.
    let source = fixed_width_corpus(&tmp, 5, 60);
    let config = TrainingConfig {
        checkpoint_interval: Duration::ZERO,
        ..config(1)
    };

    {
        let mut trainer = open(&tmp, config.clone());
        let outcome = trainer
            .train(&source, false, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.documents_processed, 5);
    }

    let dir = data_dir(&tmp);
    let manager =
        CheckpointManager::new(&dir.checkpoints_dir().unwrap(), 0).unwrap();
    let sequences: Vec<u64> =
        manager.list().unwrap().iter().map(|f| f.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

    // Simulate a crash before completion: no final model, and the two
    // newest checkpoints damaged.
    fs::remove_file(dir.model_file()).unwrap();
    fs::write(manager.path_for(5), b"").unwrap();
    let damaged = fs::read(manager.path_for(4)).unwrap();
    fs::write(manager.path_for(4), &damaged[..damaged.len() / 2]).unwrap();

    let (snapshot, file) = manager.load_latest().unwrap().unwrap();
    assert_eq!(file.sequence, 3);
    assert_eq!(snapshot.progress.processed_documents, 3);

    let reports: Reports = Arc::default();
    let mut trainer = open(&tmp, config).with_progress(Box::new(Recorder {
        reports: Arc::clone(&reports),
        cancel: None,
    }));
    let outcome = trainer
        .train(&source, false, &CancellationToken::new())
        .unwrap();

    assert_eq!(outcome.result, OutcomeKind::Completed);
    assert_eq!(outcome.documents_processed, 5);
    assert_eq!(outcome.total_documents, 5);
    // Documents stored after checkpoint 3 were replayed, not duplicated.
    assert_eq!(trainer.store().len().unwrap(), 5);
    let reports = reports.lock().unwrap();
    assert_eq!(*reports, vec![(4, 5), (5, 5)]);
    assert_bounded(&reports);

    // New checkpoints continue the numbering.
    let newest = manager.list().unwrap().last().unwrap().sequence;
    assert_eq!(newest, 7);
}

#[test]
fn restored_model_predicts_like_the_original() {
    let tmp = tempfile::tempdir().unwrap();
    let source = fixed_width_corpus(&tmp, 30, 50);

    let mut trainer = open(&tmp, config(4));
    trainer
        .train(&source, false, &CancellationToken::new())
        .unwrap();

    let path = tmp.path().join("copy.bin");
    checkpoint::write_snapshot(&path, &trainer.snapshot(1)).unwrap();
    let restored = checkpoint::read_snapshot(&path).unwrap();

    for query in ["rivers", "planets and stars", "cheese", "nothing matches"] {
        let original = trainer.encoder().encode(query);
        let copy = restored.encoder.encode(query);
        assert_eq!(
            trainer.clusters().predict(&original).unwrap(),
            restored.clusters.predict(&copy).unwrap()
        );
    }
    assert_eq!(&restored.clusters, trainer.clusters());
}

#[test]
fn query_returns_at_most_five_sorted_results() {
    let tmp = tempfile::tempdir().unwrap();
    let source = fixed_width_corpus(&tmp, 30, 50);

    let mut trainer = open(&tmp, config(4));
    trainer
        .train(&source, false, &CancellationToken::new())
        .unwrap();

    let result = trainer.ranker().rank("stars and planets").unwrap();
    assert_eq!(result.documents.len(), TOP_K);
    for pair in result.documents.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    for doc in &result.documents {
        let content = trainer.store().get(doc.id).unwrap().unwrap();
        assert!(content.contains("stars and planets"), "{content}");
    }
}

#[test]
fn query_from_saved_state_in_a_new_process() {
    let tmp = tempfile::tempdir().unwrap();
    let source = fixed_width_corpus(&tmp, 12, 50);
    {
        let mut trainer = open(&tmp, config(4));
        trainer
            .train(&source, false, &CancellationToken::new())
            .unwrap();
    }

    let dir = data_dir(&tmp);
    let manager =
        CheckpointManager::new(&dir.checkpoints_dir().unwrap(), 0).unwrap();
    let snapshot = checkpoint::load_newest_state(&dir.model_file(), &manager)
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.progress.processed_documents, 12);

    let store = streamrank::DocumentStore::open(&dir.documents_db()).unwrap();
    let answer = QueryRanker::from_snapshot(&snapshot, &store)
        .answer("bread and cheese")
        .unwrap();
    assert!(!answer.sources.is_empty());
    assert!(answer.sources[0].content.contains("bread and cheese"));
    assert!(answer.text.contains("bread and cheese"));
}

#[test]
fn missing_dataset_is_rejected_up_front() {
    let tmp = tempfile::tempdir().unwrap();
    let mut trainer = open(&tmp, config(10));
    let missing: &Path = &tmp.path().join("missing.txt");
    assert!(
        trainer
            .train(missing, false, &CancellationToken::new())
            .is_err()
    );
    assert!(
        trainer
            .increment(missing, &CancellationToken::new())
            .is_err()
    );
    assert_eq!(trainer.processed_documents(), 0);
}
