//! streamrank - incremental clustering and retrieval over large text corpora.
//!
//! Datasets are streamed through a memory-mapped [`BatchReader`], normalized,
//! hashed into sparse vectors and fed to a mini-batch k-means model one batch
//! at a time. Normalized documents are kept in a redb-backed
//! [`DocumentStore`]; training state is checkpointed periodically so that an
//! interrupted run resumes where it stopped.
//!
//! # Quick start
//!
//! ```no_run
//! use std::path::Path;
//!
//! use streamrank::{CancellationToken, ConfigDb, DataDir, Trainer};
//! use streamrank::config::TrainingConfig;
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config_db = ConfigDb::open(&data_dir.config_db()).unwrap();
//! let config = TrainingConfig::resolve(&config_db).unwrap();
//!
//! let mut trainer = Trainer::open(&data_dir, config).unwrap();
//! let outcome = trainer
//!     .train(Path::new("corpus.txt"), false, &CancellationToken::new())
//!     .unwrap();
//! println!(
//!     "{}/{} documents",
//!     outcome.documents_processed, outcome.total_documents
//! );
//!
//! let answer = trainer.ranker().answer("how do mini-batches work").unwrap();
//! print!("{}", answer.text);
//! ```

pub mod batch_reader;
pub mod cancel;
pub mod checkpoint;
pub mod cleaner;
pub mod clusterer;
pub mod config;
pub mod config_db;
pub mod data_dir;
pub mod document_store;
pub mod encoder;
pub mod error;
pub mod governor;
pub mod normalizer;
pub mod ranker;
pub mod trainer;

pub use batch_reader::BatchReader;
pub use cancel::CancellationToken;
pub use checkpoint::{CheckpointManager, Snapshot};
pub use clusterer::ClusterModel;
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use document_store::{DedupPolicy, DocumentStore};
pub use encoder::FeatureEncoder;
pub use error::{Error, Result};
pub use governor::ResourceGovernor;
pub use ranker::QueryRanker;
pub use trainer::Trainer;
