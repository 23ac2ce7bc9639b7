use clap::Parser;
use kdam::{Bar, BarExt, tqdm};
use streamrank::{
    CancellationToken,
    CheckpointManager,
    ConfigDb,
    DataDir,
    DocumentStore,
    QueryRanker,
    Trainer,
    checkpoint,
    cleaner::{self, CleanMode},
    config::{self, TrainingConfig, keys},
    error::{self, Error},
    ranker::CandidatePolicy,
    trainer::{OutcomeKind, ProgressSink},
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{
    CheckpointAction,
    Cli,
    Command,
    ConfigAction,
    TrainingOverrides,
};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("STREAMRANK_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

/// Progress bar on stderr.
#[derive(Default)]
struct BarProgress {
    bar: Option<Bar>,
}

impl ProgressSink for BarProgress {
    fn start(&mut self, processed: u64, total: u64) {
        let mut bar = tqdm!(total = total as usize, desc = "training");
        let _ = bar.update_to(processed as usize);
        self.bar = Some(bar);
    }

    fn advance(&mut self, processed: u64, _total: u64) {
        if let Some(bar) = self.bar.as_mut() {
            let _ = bar.update_to(processed as usize);
        }
    }

    fn finish(&mut self) {
        if let Some(mut bar) = self.bar.take() {
            let _ = bar.refresh();
            eprintln!();
        }
    }
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;

    match cli.command {
        Command::Train(args) => {
            let mut trainer = open_trainer(
                &data_dir,
                &config_db,
                &args.overrides,
                args.no_progress,
            )?;
            let outcome = trainer.train(
                &args.path,
                args.clean,
                &CancellationToken::new(),
            )?;
            if args.json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Training {}: {}/{} documents",
                    result_label(outcome.result),
                    outcome.documents_processed,
                    outcome.total_documents
                );
            }
        }
        Command::Increment(args) => {
            let mut trainer = open_trainer(
                &data_dir,
                &config_db,
                &args.overrides,
                args.no_progress,
            )?;
            let outcome =
                trainer.increment(&args.path, &CancellationToken::new())?;
            if args.json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Increment {}: {} new documents",
                    result_label(outcome.result),
                    outcome.new_documents_processed
                );
            }
        }
        Command::Query(args) => {
            cmd_query(&config_db, &data_dir, &args)?;
        }
        Command::Clean(args) => {
            let mode = if args.in_place {
                CleanMode::InPlace
            } else {
                CleanMode::Sidecar
            };
            let outcome = cleaner::clean_dataset(&args.path, mode);
            if args.json {
                print_json(&outcome)?;
            } else if let Some(error) = &outcome.error {
                println!("Cleaning failed: {error}");
            } else {
                println!(
                    "Cleaned {} of {} lines ({} problematic) into {}",
                    outcome.cleaned_lines,
                    outcome.total_lines,
                    outcome.problematic_lines,
                    outcome
                        .output_file
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                );
            }
        }
        Command::Status(args) => {
            cmd_status(&config_db, &data_dir, args.json)?;
        }
        Command::Config { action } => match action {
            ConfigAction::Show { json } => config_show(&config_db, json)?,
            ConfigAction::Set { key, value } => {
                config::validate_setting(&key, &value)?;
                config_db.set_setting(&key, &value)?;
                println!("{key} = {value}");
            }
            ConfigAction::Unset { key } => {
                if config_db.remove_setting(&key)? {
                    println!("Removed {key}");
                } else {
                    println!("{key} was not set");
                }
            }
        },
        Command::Checkpoints { action } => match action {
            CheckpointAction::List { json } => {
                checkpoints_list(&config_db, &data_dir, json)?;
            }
        },
        Command::SaveModel => {
            let config = TrainingConfig::resolve(&config_db)?;
            let mut trainer = Trainer::open(&data_dir, config)?;
            if !trainer.restore_latest()? {
                return Err(Error::NotTrained);
            }
            let path = trainer.save_model()?;
            println!("Model saved to {}", path.display());
        }
        Command::Completions(args) => {
            args.generate();
        }
    }

    Ok(())
}

fn open_trainer(
    data_dir: &DataDir,
    config_db: &ConfigDb,
    overrides: &TrainingOverrides,
    no_progress: bool,
) -> error::Result<Trainer> {
    let mut config = TrainingConfig::resolve(config_db)?;
    overrides.apply(&mut config);
    let trainer = Trainer::open(data_dir, config)?;
    Ok(if no_progress {
        trainer
    } else {
        trainer.with_progress(Box::new(BarProgress::default()))
    })
}

fn result_label(result: OutcomeKind) -> &'static str {
    match result {
        OutcomeKind::Completed => "completed",
        OutcomeKind::Interrupted => "interrupted",
        OutcomeKind::Error => "failed",
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> error::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Config(e.to_string()))?;
    println!("{json}");
    Ok(())
}

const NOT_TRAINED: &str =
    "The model has not been trained yet. Train it before asking questions.";

fn cmd_query(
    config_db: &ConfigDb,
    data_dir: &DataDir,
    args: &cli::QueryArgs,
) -> error::Result<()> {
    let config = TrainingConfig::resolve(config_db)?;
    let checkpoints = CheckpointManager::new(
        &data_dir.checkpoints_dir()?,
        config.max_checkpoints,
    )?;
    let Some(snapshot) =
        checkpoint::load_newest_state(&data_dir.model_file(), &checkpoints)?
    else {
        println!("{NOT_TRAINED}");
        return Ok(());
    };
    let store = DocumentStore::open(&data_dir.documents_db())?;

    let policy = if args.cluster_filter {
        CandidatePolicy::PredictedCluster
    } else {
        CandidatePolicy::Uniform
    };
    let ranker =
        QueryRanker::from_snapshot(&snapshot, &store).with_policy(policy);

    match ranker.answer(&args.query) {
        Ok(answer) if args.json => print_json(&answer)?,
        Ok(answer) => print!("{}", answer.text),
        Err(Error::NotTrained) => println!("{NOT_TRAINED}"),
        Err(e) => return Err(e),
    }
    Ok(())
}

fn cmd_status(
    config_db: &ConfigDb,
    data_dir: &DataDir,
    json: bool,
) -> error::Result<()> {
    let config = TrainingConfig::resolve(config_db)?;
    let mut trainer = Trainer::open(data_dir, config)?;
    trainer.restore_latest()?;

    let progress = trainer.progress();
    let documents = trainer.store().len()?;
    let checkpoints = trainer.checkpoints().list()?.len();
    let clusters = trainer.clusters();

    if json {
        print_json(&serde_json::json!({
            "data_dir": data_dir.root(),
            "trained": trainer.is_trained(),
            "documents_processed": progress.processed_documents,
            "total_documents": progress.total_documents,
            "stored_documents": documents,
            "clusters_seeded": clusters.seeded(),
            "n_clusters": clusters.n_clusters(),
            "checkpoints": checkpoints,
            "source": progress.source.as_ref().map(|s| &s.path),
        }))?;
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!(
            "Model: {}",
            if trainer.is_trained() {
                "trained"
            } else {
                "not trained"
            }
        );
        println!(
            "Documents processed: {}/{}",
            progress.processed_documents, progress.total_documents
        );
        println!("Stored documents: {documents}");
        println!(
            "Clusters: {}/{} seeded",
            clusters.seeded(),
            clusters.n_clusters()
        );
        println!("Checkpoints: {checkpoints}");
        if let Some(source) = &progress.source {
            println!(
                "Last source: {} ({})",
                source.path.display(),
                if source.completed {
                    "completed"
                } else {
                    "unfinished"
                }
            );
        }
    }
    Ok(())
}

fn config_show(config_db: &ConfigDb, json: bool) -> error::Result<()> {
    let config = TrainingConfig::resolve(config_db)?;
    let values = [
        (keys::N_CLUSTERS, config.n_clusters.to_string()),
        (keys::BATCH_SIZE, config.batch_size.to_string()),
        (
            keys::CHECKPOINT_INTERVAL_SECS,
            config.checkpoint_interval.as_secs().to_string(),
        ),
        (keys::MAX_CHECKPOINTS, config.max_checkpoints.to_string()),
        (keys::N_FEATURES, config.n_features.to_string()),
        (keys::DEDUP, config.dedup.to_string()),
    ];

    if json {
        let map: serde_json::Map<String, serde_json::Value> = values
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(v.as_str())))
            .collect();
        print_json(&map)?;
    } else {
        for (key, value) in &values {
            let marker = if config_db.get_setting(key)?.is_some() {
                ""
            } else {
                " (default)"
            };
            println!("{key} = {value}{marker}");
        }
    }
    Ok(())
}

fn checkpoints_list(
    config_db: &ConfigDb,
    data_dir: &DataDir,
    json: bool,
) -> error::Result<()> {
    let config = TrainingConfig::resolve(config_db)?;
    let manager = CheckpointManager::new(
        &data_dir.checkpoints_dir()?,
        config.max_checkpoints,
    )?;
    let files = manager.list()?;

    if json {
        let entries: Vec<serde_json::Value> = files
            .iter()
            .map(|f| {
                serde_json::json!({
                    "sequence": f.sequence,
                    "path": f.path,
                    "bytes": f.size,
                })
            })
            .collect();
        print_json(&entries)?;
    } else if files.is_empty() {
        println!("No checkpoints.");
    } else {
        for file in &files {
            println!(
                "#{:<4} {:>12} bytes  {}",
                file.sequence,
                file.size,
                file.path.display()
            );
        }
    }
    Ok(())
}
