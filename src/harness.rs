//! Benchmark harness: timed index builds over a shared cursor.
//!
//! A run loads the source once, then executes each trial:
//!
//! 1. rewind the cursor (untimed), and count records if the source gives no hint
//! 2. start a monotonic timer
//! 3. create the builder, drain every record into it
//! 4. finish + join + flush (spatial) or close (key-value)
//! 5. stop the timer, then measure the artifact size on disk
//!
//! A failed trial is reported with the elapsed time up to the failure,
//! marked invalid, and the run moves on to the next trial.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sysinfo::{ProcessRefreshKind, RefreshKind, System};

use crate::config::{BenchConfig, DatasetConfig, IndexKind, TrialConfig};
use crate::cursor::BufferedPointCursor;
use crate::error::{IndexError, Result};
use crate::kv::{KeyValueIndexBuilder, KvConfig};
use crate::record::PointRecord;
use crate::source::MeshSource;
use crate::spatial::{DocId, SpatialArtifacts, SpatialConfig, SpatialIndexBuilder};

const MIB: f64 = 1024.0 * 1024.0;

/// Base name of spatial file sets inside a trial directory.
pub const SPATIAL_BASE_NAME: &str = "points";

// ── Artifacts ───────────────────────────────────────────────────────

/// What a completed build left on disk.
#[derive(Debug, Clone)]
pub enum Artifact {
    FileSet(SpatialArtifacts),
    Directory(PathBuf),
}

impl Artifact {
    /// Bytes on disk.
    pub fn disk_size(&self) -> Result<u64> {
        match self {
            Artifact::FileSet(files) => files.disk_size(),
            Artifact::Directory(dir) => directory_size(dir),
        }
    }
}

/// Output of `TrialBuilder::complete`.
#[derive(Debug, Clone)]
pub struct Built {
    pub artifact: Artifact,
    /// Index entries written (points for spatial, key/value pairs for key-value).
    pub entries: u64,
}

/// Total size of regular files below `path`.
pub fn directory_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += directory_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

// ── TrialBuilder ────────────────────────────────────────────────────

/// An index under construction, as seen by the harness.
pub trait TrialBuilder {
    /// Add one record. `doc_id` is the record's position in the stream.
    fn ingest(&mut self, doc_id: u64, record: &PointRecord) -> Result<()>;

    /// Make the index durable and report where it lives.
    fn complete(self) -> Result<Built>;

    /// Release resources after a failure.
    fn abandon(self);
}

/// Spatial trial: buffer, bulk load in the background, flush three files.
pub struct SpatialTrial {
    builder: SpatialIndexBuilder,
    dir: PathBuf,
}

impl SpatialTrial {
    pub fn new(config: SpatialConfig, expected_records: u64, dir: &Path) -> Result<Self> {
        Ok(Self {
            builder: SpatialIndexBuilder::new(config, expected_records)?,
            dir: dir.to_path_buf(),
        })
    }
}

impl TrialBuilder for SpatialTrial {
    fn ingest(&mut self, doc_id: u64, record: &PointRecord) -> Result<()> {
        let doc_id = DocId::try_from(doc_id).map_err(|_| IndexError::CapacityExceeded {
            capacity: self.builder.capacity(),
        })?;
        self.builder.add(&record.encode(), doc_id)
    }

    fn complete(mut self) -> Result<Built> {
        let pending = self.builder.finish()?;
        // Single join point: nothing is measured until the load is done.
        let handle = pending.join()?;
        let entries = handle.point_count() as u64;
        let files = handle.flush_to_dir(&self.dir, SPATIAL_BASE_NAME)?;
        self.builder.close();
        Ok(Built {
            artifact: Artifact::FileSet(files),
            entries,
        })
    }

    fn abandon(mut self) {
        self.builder.close();
    }
}

/// Key-value trial: one write batch per record, flush on close.
pub struct KvTrial {
    builder: KeyValueIndexBuilder,
}

impl KvTrial {
    pub fn open(config: KvConfig, dir: &Path) -> Result<Self> {
        Ok(Self {
            builder: KeyValueIndexBuilder::open(dir, config)?,
        })
    }
}

impl TrialBuilder for KvTrial {
    fn ingest(&mut self, _doc_id: u64, record: &PointRecord) -> Result<()> {
        self.builder.put(record)
    }

    fn complete(mut self) -> Result<Built> {
        let stats = self.builder.close()?;
        Ok(Built {
            artifact: Artifact::Directory(self.builder.path().to_path_buf()),
            entries: stats.puts,
        })
    }

    fn abandon(mut self) {
        if let Err(e) = self.builder.close() {
            tracing::warn!("closing abandoned store: {}", e);
        }
    }
}

// ── Reports ─────────────────────────────────────────────────────────

/// Measurements of a completed trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialResult {
    pub elapsed: Duration,
    pub index_size_bytes: u64,
    pub records: u64,
    /// Index entries written for those records.
    pub entries: u64,
    /// Growth of process resident memory across the trial.
    pub rss_delta_bytes: u64,
}

#[derive(Debug)]
pub enum TrialOutcome {
    Completed(TrialResult),
    /// `elapsed` covers the work up to the failure and is not a valid timing.
    Failed {
        elapsed: Duration,
        records: u64,
        error: IndexError,
    },
}

/// One line of benchmark output.
#[derive(Debug)]
pub struct TrialReport {
    pub description: String,
    pub outcome: TrialOutcome,
}

impl TrialReport {
    pub fn elapsed(&self) -> Duration {
        match &self.outcome {
            TrialOutcome::Completed(r) => r.elapsed,
            TrialOutcome::Failed { elapsed, .. } => *elapsed,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.outcome, TrialOutcome::Completed(_))
    }

    pub fn result(&self) -> Option<&TrialResult> {
        match &self.outcome {
            TrialOutcome::Completed(r) => Some(r),
            TrialOutcome::Failed { .. } => None,
        }
    }
}

impl fmt::Display for TrialReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed().as_secs_f64();
        match &self.outcome {
            TrialOutcome::Completed(r) => {
                writeln!(f, "{}: {:.3} secs", self.description, secs)?;
                write!(
                    f,
                    "  index size: {:.2} MiB, {} records, {} entries, rss +{:.1} MiB",
                    r.index_size_bytes as f64 / MIB,
                    r.records,
                    r.entries,
                    r.rss_delta_bytes as f64 / MIB
                )
            }
            TrialOutcome::Failed {
                records, error, ..
            } => {
                writeln!(f, "{}: {:.3} secs (PARTIAL, INVALID)", self.description, secs)?;
                write!(
                    f,
                    "  failed after {} records: [{}] {}",
                    records,
                    error.code(),
                    error
                )
            }
        }
    }
}

// ── BenchmarkHarness ────────────────────────────────────────────────

/// Lifecycle of the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Idle,
    SourceLoaded,
    Streaming,
    Finished,
    Failed,
}

/// Drives trials and records timings.
pub struct BenchmarkHarness {
    state: TrialState,
    load_elapsed: Option<Duration>,
}

impl Default for BenchmarkHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn process_rss() -> u64 {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
    );
    sys.refresh_processes();
    sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid).map(|p| p.memory()))
        .unwrap_or(0)
}

impl BenchmarkHarness {
    pub fn new() -> Self {
        Self {
            state: TrialState::Idle,
            load_elapsed: None,
        }
    }

    pub fn state(&self) -> TrialState {
        self.state
    }

    /// Time spent opening the source, once loaded.
    pub fn load_elapsed(&self) -> Option<Duration> {
        self.load_elapsed
    }

    /// Open the dataset once for all trials.
    pub fn load_source(
        &mut self,
        dataset: &DatasetConfig,
        batch_size: usize,
    ) -> Result<BufferedPointCursor<Box<dyn MeshSource>>> {
        let start = Instant::now();
        let source = dataset.open()?;
        let elapsed = start.elapsed();

        tracing::info!(
            dataset = %dataset.describe(),
            points = ?source.num_points(),
            elements = ?source.num_elements(),
            "loaded source in {:.3} secs",
            elapsed.as_secs_f64()
        );
        self.load_elapsed = Some(elapsed);
        self.state = TrialState::SourceLoaded;
        Ok(BufferedPointCursor::with_batch_size(source, batch_size))
    }

    /// Run one configured trial, writing artifacts into `dir`.
    pub fn run_trial<S: MeshSource>(
        &mut self,
        cursor: &mut BufferedPointCursor<S>,
        trial: &TrialConfig,
        dir: &Path,
    ) -> TrialReport {
        if let Err(error) = clear_dir(dir) {
            return self.fail_early(&trial.description, error);
        }
        match &trial.index {
            IndexKind::Spatial(config) => {
                self.run_trial_with(cursor, &trial.description, |expected| {
                    SpatialTrial::new(*config, expected, dir)
                })
            }
            IndexKind::KeyValue(config) => {
                self.run_trial_with(cursor, &trial.description, |_| KvTrial::open(*config, dir))
            }
        }
    }

    /// Run a trial over any builder. `factory` receives the expected record count.
    pub fn run_trial_with<S, B, F>(
        &mut self,
        cursor: &mut BufferedPointCursor<S>,
        description: &str,
        factory: F,
    ) -> TrialReport
    where
        S: MeshSource,
        B: TrialBuilder,
        F: FnOnce(u64) -> Result<B>,
    {
        let expected = match rewind_and_count(cursor) {
            Ok(n) => n,
            Err(error) => return self.fail_early(description, error),
        };

        self.state = TrialState::Streaming;
        let rss_before = process_rss();
        let start = Instant::now();
        let mut records = 0u64;

        let built = factory(expected).and_then(|mut builder| {
            let drained = loop {
                match cursor.next() {
                    Ok(Some(record)) => {
                        if let Err(e) = builder.ingest(records, &record) {
                            break Err(e);
                        }
                        records += 1;
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            match drained {
                Ok(()) => builder.complete(),
                Err(e) => {
                    builder.abandon();
                    Err(e)
                }
            }
        });
        let elapsed = start.elapsed();

        let measured = built.and_then(|b| Ok((b.artifact.disk_size()?, b.entries)));
        let outcome = match measured {
            Ok((index_size_bytes, entries)) => {
                self.state = TrialState::Finished;
                TrialOutcome::Completed(TrialResult {
                    elapsed,
                    index_size_bytes,
                    records,
                    entries,
                    rss_delta_bytes: process_rss().saturating_sub(rss_before),
                })
            }
            Err(error) => {
                self.state = TrialState::Failed;
                tracing::warn!(
                    trial = description,
                    records,
                    "trial failed after {:.3} secs: {}",
                    elapsed.as_secs_f64(),
                    error
                );
                TrialOutcome::Failed {
                    elapsed,
                    records,
                    error,
                }
            }
        };

        let report = TrialReport {
            description: description.to_string(),
            outcome,
        };
        if let Some(r) = report.result() {
            tracing::info!(
                trial = description,
                records = r.records,
                bytes = r.index_size_bytes,
                "trial finished in {:.3} secs",
                r.elapsed.as_secs_f64()
            );
        }
        report
    }

    /// Run every trial of `config` against one cursor.
    pub fn run_all<S: MeshSource>(
        &mut self,
        cursor: &mut BufferedPointCursor<S>,
        config: &BenchConfig,
    ) -> Vec<TrialReport> {
        let mut reports = Vec::with_capacity(config.trials.len());
        for (position, trial) in config.trials.iter().enumerate() {
            let dir = config.trial_dir(position);
            let report = self.run_trial(cursor, trial, &dir);
            if !config.keep_artifacts {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("removing {}: {}", dir.display(), e);
                    }
                }
            }
            let fatal = matches!(
                &report.outcome,
                TrialOutcome::Failed { error, .. } if error.is_fatal_to_run()
            );
            reports.push(report);
            if fatal {
                tracing::error!("aborting run after trial {}", position);
                break;
            }
        }
        reports
    }

    fn fail_early(&mut self, description: &str, error: IndexError) -> TrialReport {
        self.state = TrialState::Failed;
        tracing::warn!(trial = description, "trial not started: {}", error);
        TrialReport {
            description: description.to_string(),
            outcome: TrialOutcome::Failed {
                elapsed: Duration::ZERO,
                records: 0,
                error,
            },
        }
    }
}

/// Rewind `cursor` to the first record and return the expected record count.
///
/// A fresh cursor is not rewound, so forward-only sources can serve one
/// trial. Without a count hint, one extra pass counts the records.
fn rewind_and_count<S: MeshSource>(cursor: &mut BufferedPointCursor<S>) -> Result<u64> {
    if !cursor.is_at_start() {
        cursor.reset()?;
    }
    if let Some(hint) = cursor.count_hint() {
        return Ok(hint);
    }

    let start = Instant::now();
    let mut count = 0u64;
    while cursor.next_raw()?.is_some() {
        count += 1;
    }
    cursor.reset()?;
    tracing::debug!(
        count,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "counted records without a source hint"
    );
    Ok(count)
}

fn clear_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────
