//! meshidx - streaming point extraction and index build benchmarks.
//!
//! Points sampled from a hydrodynamics mesh (position, energy, density,
//! velocity, owning element) are pulled through a batch-buffered cursor and
//! fed into one of two index builders:
//!
//! - a bulk-loaded block k-d tree (`spatial`), flushed as three files
//! - a RocksDB store holding one sorted projection per dimension (`kv`)
//!
//! The `harness` times each build and reports elapsed seconds and on-disk
//! size.
//!
//! # Usage
//!
//! ```no_run
//! use meshidx::config::BenchConfig;
//! use meshidx::harness::BenchmarkHarness;
//! use std::path::Path;
//!
//! let config = BenchConfig::load(Path::new("bench.json")).unwrap();
//! let mut harness = BenchmarkHarness::new();
//! let mut cursor = harness.load_source(&config.dataset, config.batch_size).unwrap();
//! for report in harness.run_all(&mut cursor, &config) {
//!     println!("{}", report);
//! }
//! ```

pub mod config;
pub mod cursor;
pub mod error;
pub mod harness;
pub mod kv;
pub mod record;
pub mod source;
pub mod spatial;

pub use config::{BenchConfig, DatasetConfig, IndexKind, TrialConfig};
pub use cursor::{BufferedPointCursor, CursorState, DEFAULT_BATCH_SIZE};
pub use error::{IndexError, Result};
pub use harness::{BenchmarkHarness, TrialBuilder, TrialReport, TrialResult, TrialState};
pub use kv::{KeyValueIndexBuilder, KvConfig};
pub use record::{PointRecord, RECORD_SIZE};
pub use source::{Fetch, MeshSource, SourcePosition};
pub use spatial::{SpatialConfig, SpatialIndexBuilder};
