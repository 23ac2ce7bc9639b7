use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use streamrank::config::TrainingConfig;

#[derive(Debug, Parser)]
#[command(
    name = "streamrank",
    about = "Incremental clustering and retrieval over large text corpora"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Train the model on a newline-delimited dataset
    Train(TrainArgs),
    /// Clean a new dataset and add it to an existing model
    Increment(IncrementArgs),
    /// Answer a question from the stored documents
    Query(QueryArgs),
    /// Strip control characters and blank lines from a dataset
    Clean(CleanArgs),
    /// Show training progress and store statistics
    Status(StatusArgs),
    /// Inspect or change persisted training settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect saved checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Write the current model state to model.bin
    SaveModel,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Training --

/// Per-invocation overrides of the stored training settings.
#[derive(Debug, Default, clap::Args)]
pub struct TrainingOverrides {
    /// Documents per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Number of clusters (only used for a new model)
    #[arg(long)]
    pub n_clusters: Option<usize>,

    /// Seconds of training between checkpoints
    #[arg(long)]
    pub checkpoint_interval: Option<u64>,

    /// Checkpoints kept on disk (0 keeps all)
    #[arg(long)]
    pub max_checkpoints: Option<usize>,

    /// Skip documents whose content is already stored
    #[arg(long)]
    pub dedup: bool,
}

impl TrainingOverrides {
    pub fn apply(&self, config: &mut TrainingConfig) {
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(n_clusters) = self.n_clusters {
            config.n_clusters = n_clusters;
        }
        if let Some(secs) = self.checkpoint_interval {
            config.checkpoint_interval = std::time::Duration::from_secs(secs);
        }
        if let Some(max) = self.max_checkpoints {
            config.max_checkpoints = max;
        }
        if self.dedup {
            config.dedup = true;
        }
    }
}

#[derive(Debug, Parser)]
pub struct TrainArgs {
    /// Path to the dataset
    pub path: PathBuf,

    /// Clean the dataset into a .clean sidecar before training
    #[arg(long)]
    pub clean: bool,

    #[command(flatten)]
    pub overrides: TrainingOverrides,

    /// Output the outcome as JSON
    #[arg(long)]
    pub json: bool,

    /// Do not draw a progress bar
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Debug, Parser)]
pub struct IncrementArgs {
    /// Path to the new dataset
    pub path: PathBuf,

    #[command(flatten)]
    pub overrides: TrainingOverrides,

    /// Output the outcome as JSON
    #[arg(long)]
    pub json: bool,

    /// Do not draw a progress bar
    #[arg(long)]
    pub no_progress: bool,
}

// -- Query --

#[derive(Debug, Parser)]
pub struct QueryArgs {
    /// The question
    pub query: String,

    /// Only consider documents from the query's predicted cluster
    #[arg(long)]
    pub cluster_filter: bool,

    /// Output the ranked documents as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Clean --

#[derive(Debug, Parser)]
pub struct CleanArgs {
    /// Path to the dataset
    pub path: PathBuf,

    /// Replace the dataset when every line decodes cleanly
    #[arg(long)]
    pub in_place: bool,

    /// Output the outcome as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show every setting with its effective value
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting in config.redb
    Set {
        /// Setting name (e.g. batch_size)
        key: String,
        /// New value
        value: String,
    },
    /// Remove a stored setting (revert to default)
    Unset {
        /// Setting name
        key: String,
    },
}

// -- Checkpoints --

#[derive(Debug, Subcommand)]
pub enum CheckpointAction {
    /// List checkpoint files, oldest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "streamrank",
            &mut std::io::stdout(),
        );
    }
}
