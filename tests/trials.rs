//! Integration test: full benchmark runs over in-memory and file sources.
//!
//! Exercises the harness the way the CLI does: one cursor shared by several
//! trials, artifacts measured on disk, failures isolated per trial.

use std::fs;

use meshidx::config::{BenchConfig, DatasetConfig, IndexKind, TrialConfig};
use meshidx::harness::{BenchmarkHarness, TrialOutcome, TrialState, SPATIAL_BASE_NAME};
use meshidx::kv::{count_store_entries, KvConfig};
use meshidx::record::PointRecord;
use meshidx::source::{write_point_file, Fetch, MemorySource, MeshSource, SourcePosition};
use meshidx::spatial::{KdIndexReader, KeyRange, SpatialArtifacts, SpatialConfig};
use meshidx::{BufferedPointCursor, IndexError};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Records with distinct values in every dimension, four per element.
fn distinct_records(n: u64) -> Vec<PointRecord> {
    (0..n)
        .map(|i| {
            let f = i as f64;
            PointRecord {
                x: f,
                y: f + 0.25,
                z: f * -1.5,
                e: 100.0 + f,
                rho: 1.0 + f * 1e-3,
                v_x: f * 2.0,
                v_y: f * 3.0,
                v_z: f * 4.0,
                element_id: i / 4,
            }
        })
        .collect()
}

fn spatial_trial(description: &str) -> TrialConfig {
    TrialConfig {
        description: description.to_string(),
        index: IndexKind::Spatial(SpatialConfig::default()),
    }
}

fn kv_trial(description: &str, fanout: usize) -> TrialConfig {
    TrialConfig {
        description: description.to_string(),
        index: IndexKind::KeyValue(KvConfig {
            fanout,
            ..Default::default()
        }),
    }
}

/// Reports a point count beyond the doc id range, whatever it holds.
struct HugeHintSource(MemorySource);

impl MeshSource for HugeHintSource {
    fn read_batch(&mut self, at: SourcePosition, out: &mut [u8]) -> Fetch {
        self.0.read_batch(at, out)
    }

    fn at_end(&self, at: SourcePosition) -> bool {
        self.0.at_end(at)
    }

    fn num_elements(&self) -> Option<u64> {
        self.0.num_elements()
    }

    fn num_points(&self) -> Option<u64> {
        Some(u32::MAX as u64 + 1)
    }
}

/// Fails the first time it is asked for its second batch.
struct FlakySource {
    inner: MemorySource,
    fetches: u32,
    failed: bool,
}

impl MeshSource for FlakySource {
    fn read_batch(&mut self, at: SourcePosition, out: &mut [u8]) -> Fetch {
        self.fetches += 1;
        if self.fetches == 2 && !self.failed {
            self.failed = true;
            return Fetch::Error(IndexError::SourceRead("short read".to_string()));
        }
        self.inner.read_batch(at, out)
    }

    fn at_end(&self, at: SourcePosition) -> bool {
        self.inner.at_end(at)
    }

    fn num_elements(&self) -> Option<u64> {
        self.inner.num_elements()
    }

    fn num_points(&self) -> Option<u64> {
        self.inner.num_points()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn reset_replays_identical_element_sequence() {
    // 8192 elements x 8 points = 65536 records, 16 batches of 4096.
    let mut cursor =
        BufferedPointCursor::with_batch_size(MemorySource::synthetic(8192, 8), 4096);

    let mut first = Vec::with_capacity(65536);
    while let Some(record) = cursor.next().unwrap() {
        first.push(record.element_id);
    }
    assert_eq!(first.len(), 65536);
    assert_eq!(cursor.batches_fetched(), 16);

    cursor.reset().unwrap();
    let mut second = Vec::with_capacity(65536);
    while let Some(record) = cursor.next().unwrap() {
        second.push(record.element_id);
    }
    assert_eq!(first, second);
    assert!(first.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn multi_fanout_trial_writes_eight_entries_per_record() {
    let dir = TempDir::new().unwrap();
    let mut cursor = BufferedPointCursor::with_batch_size(
        MemorySource::from_records(&distinct_records(100)),
        16,
    );
    let mut harness = BenchmarkHarness::new();

    let store = dir.path().join("multi");
    let report = harness.run_trial(&mut cursor, &kv_trial("rocks multi", 8), &store);
    assert!(report.is_valid(), "{}", report);
    let result = report.result().unwrap();
    assert_eq!(result.records, 100);
    assert!(result.index_size_bytes > 0);
    assert_eq!(count_store_entries(&store).unwrap(), 800);
}

#[test]
fn kv_trials_over_shared_vertices_keep_every_entry() {
    // Lattice cells share corners, so each coordinate repeats many times.
    let dir = TempDir::new().unwrap();
    let mut cursor = BufferedPointCursor::with_batch_size(MemorySource::synthetic(200, 8), 256);
    let mut harness = BenchmarkHarness::new();

    for fanout in [1usize, 8] {
        let store = dir.path().join(format!("fanout-{}", fanout));
        let report = harness.run_trial(&mut cursor, &kv_trial("lattice", fanout), &store);
        assert!(report.is_valid(), "{}", report);
        let result = report.result().unwrap();
        assert_eq!(result.records, 1600);
        assert_eq!(result.entries, 1600 * fanout as u64);
        assert_eq!(count_store_entries(&store).unwrap(), result.entries);
        assert!(report.to_string().contains(&format!("{} entries", result.entries)));
    }
}

#[test]
fn spatial_trial_leaves_three_nonempty_files() {
    let dir = TempDir::new().unwrap();
    let mut cursor =
        BufferedPointCursor::with_batch_size(MemorySource::synthetic(1000, 8), 1024);
    let mut harness = BenchmarkHarness::new();

    let trial_dir = dir.path().join("bkd");
    let report = harness.run_trial(&mut cursor, &spatial_trial("bkd"), &trial_dir);
    assert!(report.is_valid(), "{}", report);
    assert_eq!(harness.state(), TrialState::Finished);

    let files = SpatialArtifacts::paths(&trial_dir, SPATIAL_BASE_NAME);
    assert!(files.exists());
    for path in [&files.meta, &files.data, &files.index] {
        assert!(fs::metadata(path).unwrap().len() > 0, "{} is empty", path.display());
    }
    assert_eq!(
        report.result().unwrap().index_size_bytes,
        files.disk_size().unwrap()
    );

    let reader = KdIndexReader::open(&trial_dir, SPATIAL_BASE_NAME).unwrap();
    assert_eq!(reader.point_count(), 8000);
    assert_eq!(reader.range_query(&[KeyRange::ALL; 3]).unwrap().len(), 8000);
}

#[test]
fn failed_trial_reports_partial_time_and_run_continues() {
    let dir = TempDir::new().unwrap();
    let source = FlakySource {
        inner: MemorySource::synthetic(64, 8),
        fetches: 0,
        failed: false,
    };
    let mut cursor = BufferedPointCursor::with_batch_size(source, 128);
    let mut harness = BenchmarkHarness::new();

    let broken = harness.run_trial(&mut cursor, &kv_trial("uni", 1), &dir.path().join("a"));
    assert!(!broken.is_valid());
    assert_eq!(harness.state(), TrialState::Failed);
    match &broken.outcome {
        TrialOutcome::Failed { records, error, .. } => {
            assert_eq!(*records, 128);
            assert!(matches!(error, IndexError::SourceRead(_)));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(broken.to_string().contains("INVALID"));

    let next = harness.run_trial(&mut cursor, &spatial_trial("bkd"), &dir.path().join("b"));
    assert!(next.is_valid(), "{}", next);
    assert_eq!(next.result().unwrap().records, 512);
}

#[test]
fn oversized_spatial_trial_does_not_stop_the_run() {
    let dir = TempDir::new().unwrap();
    let config = BenchConfig {
        dataset: DatasetConfig::Synthetic {
            elements: 8,
            points_per_element: 8,
        },
        batch_size: 64,
        output_dir: dir.path().join("out"),
        trials: vec![spatial_trial("bkd"), kv_trial("uni", 1)],
        keep_artifacts: true,
    };
    let mut cursor = BufferedPointCursor::with_batch_size(
        HugeHintSource(MemorySource::synthetic(8, 8)),
        config.batch_size,
    );
    let mut harness = BenchmarkHarness::new();
    let reports = harness.run_all(&mut cursor, &config);

    assert_eq!(reports.len(), 2);
    match &reports[0].outcome {
        TrialOutcome::Failed { error, .. } => {
            assert_eq!(error.code(), "CAPACITY_EXCEEDED");
            assert!(!error.is_fatal_to_run());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(reports[1].is_valid(), "{}", reports[1]);
    assert_eq!(reports[1].result().unwrap().records, 64);
}

#[test]
fn forward_only_source_serves_a_single_trial() {
    let dir = TempDir::new().unwrap();
    let mut cursor = BufferedPointCursor::new(MemorySource::synthetic(16, 8).forward_only());
    let mut harness = BenchmarkHarness::new();

    let first = harness.run_trial(&mut cursor, &kv_trial("uni", 1), &dir.path().join("a"));
    assert!(first.is_valid(), "{}", first);

    let second = harness.run_trial(&mut cursor, &kv_trial("uni", 1), &dir.path().join("b"));
    match &second.outcome {
        TrialOutcome::Failed { error, .. } => assert_eq!(error.code(), "UNSUPPORTED_RESET"),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn run_all_reports_every_trial_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let config = BenchConfig {
        dataset: DatasetConfig::Synthetic {
            elements: 200,
            points_per_element: 8,
        },
        batch_size: 256,
        output_dir: dir.path().join("out"),
        trials: vec![
            spatial_trial("BKD 3 of 9 dims"),
            kv_trial("RocksDB uni", 1),
            kv_trial("RocksDB multi", 8),
        ],
        keep_artifacts: false,
    };
    config.validate().unwrap();

    let mut harness = BenchmarkHarness::new();
    let mut cursor = harness.load_source(&config.dataset, config.batch_size).unwrap();
    let reports = harness.run_all(&mut cursor, &config);

    assert_eq!(reports.len(), 3);
    for (report, trial) in reports.iter().zip(&config.trials) {
        assert!(report.is_valid(), "{}", report);
        assert_eq!(report.description, trial.description);
        assert_eq!(report.result().unwrap().records, 1600);

        let line = report.to_string();
        let secs: f64 = line
            .lines()
            .next()
            .and_then(|l| l.strip_prefix(&format!("{}: ", trial.description)))
            .and_then(|l| l.strip_suffix(" secs"))
            .unwrap()
            .parse()
            .unwrap();
        assert!(secs >= 0.0);
    }
    for position in 0..config.trials.len() {
        assert!(!config.trial_dir(position).exists());
    }
}

#[test]
fn exported_point_file_streams_the_same_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("points.mpts");

    let mut cursor = BufferedPointCursor::with_batch_size(MemorySource::synthetic(300, 8), 500);
    let written = write_point_file(&path, std::iter::from_fn(|| cursor.next().transpose())).unwrap();
    assert_eq!(written, 2400);

    let dataset = DatasetConfig::PointFile { path: path.clone() };
    let mut harness = BenchmarkHarness::new();
    let mut from_file = harness.load_source(&dataset, 500).unwrap();
    assert_eq!(from_file.count_hint(), Some(2400));
    assert_eq!(from_file.source().num_elements(), Some(300));

    cursor.reset().unwrap();
    let mut n = 0;
    while let Some(expected) = cursor.next().unwrap() {
        assert_eq!(from_file.next().unwrap(), Some(expected));
        n += 1;
    }
    assert_eq!(n, 2400);
    assert!(from_file.next().unwrap().is_none());
}
