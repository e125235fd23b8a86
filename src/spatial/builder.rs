//! Bulk loader for the block k-d tree.
//!
//! Records are buffered by `add()`, then `finish()` hands them to a
//! background thread that partitions them into a balanced tree:
//!
//! 1. `num_leaves` = next power of two >= ceil(points / max_points_in_leaf)
//! 2. Each inner cell splits on the indexed dimension with the widest
//!    spread, at the median (`select_nth_unstable`), left half rounded up
//! 3. Subtrees above `PARALLEL_THRESHOLD` points are split with `rayon::join`
//!
//! Only the first `num_index_dims` dimensions take part in splits. The rest
//! of each record travels as payload in the leaf blocks.
//!
//! The returned `IndexHandle` is not durable until `flush_to()` (or
//! `flush_to_dir()`) succeeds. Flushing consumes the handle.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::record::{sortable_key, NUM_DIMS, RECORD_SIZE};
use crate::spatial::format::{
    compute_padding, write_file_header, KdMeta, DATA_EXTENSION, DATA_MAGIC, INDEX_EXTENSION,
    INDEX_MAGIC, META_EXTENSION,
};

/// Caller-assigned record identifier stored alongside each point.
pub type DocId = u32;

/// Subtrees smaller than this are partitioned on the current thread.
const PARALLEL_THRESHOLD: usize = 64 * 1024;

/// Upper bound on records reserved by `new()`; buffers grow past it on demand.
const MAX_INITIAL_RESERVE: usize = 1 << 20;

// ── SpatialConfig ───────────────────────────────────────────────────

/// Shape of a spatial index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// Dimensions per record (D). Always 9 for point records.
    pub num_dims: usize,
    /// Leading dimensions that take part in splits (K <= D).
    pub num_index_dims: usize,
    /// Maximum points per leaf block (L).
    pub max_points_in_leaf: usize,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            num_dims: NUM_DIMS,
            num_index_dims: 3,
            max_points_in_leaf: 512,
        }
    }
}

impl SpatialConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_dims != NUM_DIMS {
            return Err(IndexError::InvalidConfig(format!(
                "point records have {} dimensions, got num_dims = {}",
                NUM_DIMS, self.num_dims
            )));
        }
        if self.num_index_dims == 0 || self.num_index_dims > self.num_dims {
            return Err(IndexError::InvalidConfig(format!(
                "num_index_dims must be in 1..={}, got {}",
                self.num_dims, self.num_index_dims
            )));
        }
        if self.max_points_in_leaf == 0 {
            return Err(IndexError::InvalidConfig(
                "max_points_in_leaf must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ── SpatialIndexBuilder ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuilderState {
    Open,
    Finished,
    Closed,
}

/// Accumulates records for a bulk-loaded k-d tree.
pub struct SpatialIndexBuilder {
    config: SpatialConfig,
    capacity: u64,
    points: Vec<u8>,
    doc_ids: Vec<DocId>,
    state: BuilderState,
}

impl SpatialIndexBuilder {
    /// Create a builder accepting up to `total_points` records.
    pub fn new(config: SpatialConfig, total_points: u64) -> Result<Self> {
        config.validate()?;
        if total_points > DocId::MAX as u64 {
            return Err(IndexError::CapacityExceeded {
                capacity: DocId::MAX as u64,
            });
        }
        // The count may be an estimate; reserve up front only up to a cap.
        let reserve = total_points.min(MAX_INITIAL_RESERVE as u64) as usize;
        Ok(Self {
            config,
            capacity: total_points,
            points: Vec::with_capacity(reserve * RECORD_SIZE),
            doc_ids: Vec::with_capacity(reserve),
            state: BuilderState::Open,
        })
    }

    /// Append one encoded record.
    pub fn add(&mut self, raw: &[u8], doc_id: DocId) -> Result<()> {
        if self.state != BuilderState::Open {
            return Err(IndexError::BuilderClosed);
        }
        if raw.len() != RECORD_SIZE {
            return Err(IndexError::MalformedRecord { len: raw.len() });
        }
        if self.doc_ids.len() as u64 >= self.capacity {
            return Err(IndexError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.points.extend_from_slice(raw);
        self.doc_ids.push(doc_id);
        Ok(())
    }

    /// Records added so far.
    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    /// Whether no records were added.
    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    /// Declared record count.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn config(&self) -> &SpatialConfig {
        &self.config
    }

    /// Start the bulk load on a background thread.
    ///
    /// The builder accepts no more records afterwards. The load cannot be
    /// cancelled; `PendingIndex::join()` waits for it.
    pub fn finish(&mut self) -> Result<PendingIndex> {
        if self.state != BuilderState::Open {
            return Err(IndexError::BuilderClosed);
        }
        self.state = BuilderState::Finished;

        let config = self.config;
        let points = std::mem::take(&mut self.points);
        let doc_ids = std::mem::take(&mut self.doc_ids);
        let handle = thread::Builder::new()
            .name("kd-bulk-load".to_string())
            .spawn(move || bulk_load(config, points, doc_ids))?;

        Ok(PendingIndex { handle })
    }

    /// Release buffered records. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.state == BuilderState::Closed {
            return;
        }
        self.points = Vec::new();
        self.doc_ids = Vec::new();
        self.state = BuilderState::Closed;
    }
}

// ── PendingIndex ────────────────────────────────────────────────────

/// A bulk load running in the background.
pub struct PendingIndex {
    handle: JoinHandle<Result<IndexHandle>>,
}

impl PendingIndex {
    /// Block until the bulk load completes.
    pub fn join(self) -> Result<IndexHandle> {
        self.handle.join().map_err(|_| {
            IndexError::Io(io::Error::new(
                io::ErrorKind::Other,
                "k-d tree bulk load thread panicked",
            ))
        })?
    }

    /// Whether the background work has ended (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

// ── Partitioning ────────────────────────────────────────────────────

enum TreeNode {
    Inner { node: usize, dim: u8, value: u64 },
    Leaf { node: usize, range: Range<usize> },
}

#[inline]
fn raw_at(points: &[u8], i: usize) -> &[u8; RECORD_SIZE] {
    points[i * RECORD_SIZE..(i + 1) * RECORD_SIZE]
        .try_into()
        .unwrap()
}

/// Indexed dimension with the largest key spread over `order`.
fn widest_dimension(points: &[u8], order: &[u32], num_index_dims: usize) -> usize {
    let mut best = (0usize, 0u64);
    for dim in 0..num_index_dims {
        let (mut lo, mut hi) = (u64::MAX, 0u64);
        for &i in order {
            let key = sortable_key(raw_at(points, i as usize), dim);
            lo = lo.min(key);
            hi = hi.max(key);
        }
        let spread = hi.saturating_sub(lo);
        if spread > best.1 {
            best = (dim, spread);
        }
    }
    best.0
}

/// Partition `order` (the points of heap node `node`) recursively.
///
/// Every key left of the split is <= `value` and every key right of it is
/// >= `value`.
fn partition(
    points: &[u8],
    doc_ids: &[DocId],
    order: &mut [u32],
    offset: usize,
    node: usize,
    num_leaves: usize,
    num_index_dims: usize,
) -> Vec<TreeNode> {
    let len = order.len();
    if node >= num_leaves {
        return vec![TreeNode::Leaf {
            node,
            range: offset..offset + len,
        }];
    }

    let dim = widest_dimension(points, order, num_index_dims);
    let key = |i: u32| sortable_key(raw_at(points, i as usize), dim);
    let left_len = len.div_ceil(2);

    let value = if left_len < len {
        order.select_nth_unstable_by(left_len, |&a, &b| {
            key(a)
                .cmp(&key(b))
                .then(doc_ids[a as usize].cmp(&doc_ids[b as usize]))
        });
        key(order[left_len])
    } else {
        order.iter().map(|&i| key(i)).max().unwrap_or(0)
    };

    let (left, right) = order.split_at_mut(left_len);
    let recurse = |part: &mut [u32], at: usize, child: usize| {
        partition(points, doc_ids, part, at, child, num_leaves, num_index_dims)
    };
    let (mut nodes, right_nodes) = if len >= PARALLEL_THRESHOLD {
        rayon::join(
            || recurse(left, offset, 2 * node),
            || recurse(right, offset + left_len, 2 * node + 1),
        )
    } else {
        (
            recurse(left, offset, 2 * node),
            recurse(right, offset + left_len, 2 * node + 1),
        )
    };
    nodes.extend(right_nodes);
    nodes.push(TreeNode::Inner {
        node,
        dim: dim as u8,
        value,
    });
    nodes
}

fn bulk_load(config: SpatialConfig, points: Vec<u8>, doc_ids: Vec<DocId>) -> Result<IndexHandle> {
    let start = Instant::now();
    let n = doc_ids.len();
    let num_leaves = if n == 0 {
        1
    } else {
        n.div_ceil(config.max_points_in_leaf).next_power_of_two()
    };
    let k = config.num_index_dims;

    let mut order: Vec<u32> = (0..n as u32).collect();
    let nodes = partition(&points, &doc_ids, &mut order, 0, 1, num_leaves, k);

    let mut split_dims = vec![0u8; num_leaves - 1];
    let mut split_values = vec![0u64; num_leaves - 1];
    let mut leaf_ranges = vec![0..0; num_leaves];
    for node in nodes {
        match node {
            TreeNode::Inner { node, dim, value } => {
                split_dims[node - 1] = dim;
                split_values[node - 1] = value;
            }
            TreeNode::Leaf { node, range } => leaf_ranges[node - num_leaves] = range,
        }
    }

    let mut min_keys = vec![u64::MAX; k];
    let mut max_keys = vec![0u64; k];
    if n == 0 {
        min_keys.fill(0);
    }
    for i in 0..n {
        let raw = raw_at(&points, i);
        for dim in 0..k {
            let key = sortable_key(raw, dim);
            min_keys[dim] = min_keys[dim].min(key);
            max_keys[dim] = max_keys[dim].max(key);
        }
    }

    tracing::debug!(
        points = n,
        leaves = num_leaves,
        index_dims = k,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "k-d tree bulk load complete"
    );

    Ok(IndexHandle {
        config,
        points,
        doc_ids,
        order,
        split_dims,
        split_values,
        leaf_ranges,
        min_keys,
        max_keys,
    })
}

// ── IndexHandle ─────────────────────────────────────────────────────

/// A fully partitioned tree waiting to be written.
pub struct IndexHandle {
    config: SpatialConfig,
    points: Vec<u8>,
    doc_ids: Vec<DocId>,
    order: Vec<u32>,
    split_dims: Vec<u8>,
    split_values: Vec<u64>,
    leaf_ranges: Vec<Range<usize>>,
    min_keys: Vec<u64>,
    max_keys: Vec<u64>,
}

/// Writer adaptor that hashes and counts everything passing through.
struct HashingWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: blake3::Hasher,
    written: u64,
}

impl<'a, W: Write> HashingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            written: 0,
        }
    }

    fn finish(mut self) -> Result<(u64, [u8; 32])> {
        self.inner.flush()?;
        Ok((self.written, *self.hasher.finalize().as_bytes()))
    }
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl IndexHandle {
    pub fn point_count(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn num_leaves(&self) -> usize {
        self.leaf_ranges.len()
    }

    /// Largest number of points in any leaf.
    pub fn max_leaf_len(&self) -> usize {
        self.leaf_ranges.iter().map(|r| r.len()).max().unwrap_or(0)
    }

    /// Write metadata, data and index. Returns total bytes written.
    ///
    /// Data and index are written first; the metadata, which carries their
    /// lengths and checksums, comes last.
    pub fn flush_to<M: Write, D: Write, I: Write>(
        self,
        meta: &mut M,
        data: &mut D,
        index: &mut I,
    ) -> Result<u64> {
        let num_leaves = self.leaf_ranges.len();

        // Step 1: leaf blocks.
        let mut data_w = HashingWriter::new(data);
        write_file_header(&mut data_w, DATA_MAGIC)?;
        let mut leaf_fps = Vec::with_capacity(num_leaves);
        for range in &self.leaf_ranges {
            leaf_fps.push(data_w.written);
            let leaf = &self.order[range.clone()];
            data_w.write_all(&(leaf.len() as u32).to_le_bytes())?;
            for &i in leaf {
                data_w.write_all(&self.doc_ids[i as usize].to_le_bytes())?;
            }
            for &i in leaf {
                data_w.write_all(raw_at(&self.points, i as usize))?;
            }
        }
        let (data_length, data_checksum) = data_w.finish()?;

        // Step 2: tree arrays.
        let mut index_w = HashingWriter::new(index);
        write_file_header(&mut index_w, INDEX_MAGIC)?;
        index_w.write_all(&self.split_dims)?;
        let padding = compute_padding(self.split_dims.len(), 8);
        index_w.write_all(&[0u8; 8][..padding])?;
        for value in &self.split_values {
            index_w.write_all(&value.to_le_bytes())?;
        }
        for fp in &leaf_fps {
            index_w.write_all(&fp.to_le_bytes())?;
        }
        for range in &self.leaf_ranges {
            index_w.write_all(&(range.len() as u32).to_le_bytes())?;
        }
        let (index_length, index_checksum) = index_w.finish()?;

        // Step 3: metadata.
        let kd_meta = KdMeta {
            num_dims: self.config.num_dims as u32,
            num_index_dims: self.config.num_index_dims as u32,
            max_points_in_leaf: self.config.max_points_in_leaf as u32,
            num_leaves: num_leaves as u32,
            point_count: self.doc_ids.len() as u64,
            data_length,
            index_length,
            data_checksum,
            index_checksum,
            min_keys: self.min_keys,
            max_keys: self.max_keys,
        };
        kd_meta.write_to(meta)?;
        meta.flush()?;

        Ok(data_length + index_length + kd_meta.encoded_len() as u64)
    }

    /// Write the file set into `dir` under `base`, atomically.
    ///
    /// Each file goes to a `.tmp` sibling, is synced, then renamed. The
    /// metadata file is renamed last, so a visible `.kdm` implies complete
    /// data and index files.
    pub fn flush_to_dir(self, dir: &Path, base: &str) -> Result<SpatialArtifacts> {
        fs::create_dir_all(dir)?;
        let target = SpatialArtifacts::paths(dir, base);
        let tmp = [
            tmp_path(&target.data),
            tmp_path(&target.index),
            tmp_path(&target.meta),
        ];

        let result = (|| -> Result<u64> {
            let mut data = BufWriter::new(File::create(&tmp[0])?);
            let mut index = BufWriter::new(File::create(&tmp[1])?);
            let mut meta = BufWriter::new(File::create(&tmp[2])?);
            let written = self.flush_to(&mut meta, &mut data, &mut index)?;
            for w in [data, index, meta] {
                w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            }
            fs::rename(&tmp[0], &target.data)?;
            fs::rename(&tmp[1], &target.index)?;
            fs::rename(&tmp[2], &target.meta)?;
            Ok(written)
        })();

        match result {
            Ok(bytes_written) => Ok(SpatialArtifacts {
                bytes_written,
                ..target
            }),
            Err(e) => {
                for path in &tmp {
                    let _ = fs::remove_file(path);
                }
                Err(e)
            }
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

// ── SpatialArtifacts ────────────────────────────────────────────────

/// Locations of a flushed file set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialArtifacts {
    pub meta: PathBuf,
    pub data: PathBuf,
    pub index: PathBuf,
    pub bytes_written: u64,
}

impl SpatialArtifacts {
    /// Paths of the file set `base` in `dir` (nothing is written).
    pub fn paths(dir: &Path, base: &str) -> Self {
        let file = |ext: &str| dir.join(format!("{}.{}", base, ext));
        Self {
            meta: file(META_EXTENSION),
            data: file(DATA_EXTENSION),
            index: file(INDEX_EXTENSION),
            bytes_written: 0,
        }
    }

    /// Whether all three files exist.
    pub fn exists(&self) -> bool {
        self.meta.is_file() && self.data.is_file() && self.index.is_file()
    }

    /// Combined on-disk size of the three files.
    pub fn disk_size(&self) -> Result<u64> {
        let mut total = 0;
        for path in [&self.meta, &self.data, &self.index] {
            total += fs::metadata(path)?.len();
        }
        Ok(total)
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PointRecord;
    use tempfile::TempDir;

    fn point(i: u64) -> [u8; RECORD_SIZE] {
        PointRecord {
            x: (i % 17) as f64,
            y: (i % 5) as f64 * 0.5,
            z: -(i as f64),
            element_id: i / 8,
            ..Default::default()
        }
        .encode()
    }

    fn build(n: u64, config: SpatialConfig) -> IndexHandle {
        let mut builder = SpatialIndexBuilder::new(config, n).unwrap();
        for i in 0..n {
            builder.add(&point(i), i as DocId).unwrap();
        }
        builder.finish().unwrap().join().unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(SpatialConfig::default().validate().is_ok());
        let bad_k = SpatialConfig {
            num_index_dims: 10,
            ..Default::default()
        };
        assert!(matches!(bad_k.validate(), Err(IndexError::InvalidConfig(_))));
        let bad_d = SpatialConfig {
            num_dims: 3,
            ..Default::default()
        };
        assert!(bad_d.validate().is_err());
        let bad_leaf = SpatialConfig {
            max_points_in_leaf: 0,
            ..Default::default()
        };
        assert!(bad_leaf.validate().is_err());
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut builder = SpatialIndexBuilder::new(SpatialConfig::default(), 2).unwrap();
        builder.add(&point(0), 0).unwrap();
        builder.add(&point(1), 1).unwrap();
        let err = builder.add(&point(2), 2).unwrap_err();
        assert!(matches!(err, IndexError::CapacityExceeded { capacity: 2 }));
    }

    #[test]
    fn test_doc_id_overflow_is_capacity_exceeded() {
        let err = SpatialIndexBuilder::new(SpatialConfig::default(), DocId::MAX as u64 + 1)
            .err()
            .unwrap();
        assert!(matches!(err, IndexError::CapacityExceeded { .. }));
        assert!(!err.is_fatal_to_run());
    }

    #[test]
    fn test_reservation_is_capped() {
        let total = 4 * MAX_INITIAL_RESERVE as u64;
        let mut builder = SpatialIndexBuilder::new(SpatialConfig::default(), total).unwrap();
        assert_eq!(builder.capacity(), total);
        assert!(builder.doc_ids.capacity() < total as usize);
        assert!(builder.points.capacity() < total as usize * RECORD_SIZE);

        for i in 0..10 {
            builder.add(&point(i), i as DocId).unwrap();
        }
        assert_eq!(builder.len(), 10);
    }

    #[test]
    fn test_add_rejects_short_record() {
        let mut builder = SpatialIndexBuilder::new(SpatialConfig::default(), 2).unwrap();
        let err = builder.add(&point(0)[..70], 0).unwrap_err();
        assert!(matches!(err, IndexError::MalformedRecord { len: 70 }));
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_use() {
        let mut builder = SpatialIndexBuilder::new(SpatialConfig::default(), 4).unwrap();
        builder.add(&point(0), 0).unwrap();
        builder.close();
        builder.close();
        assert!(matches!(builder.add(&point(1), 1), Err(IndexError::BuilderClosed)));
        assert!(matches!(builder.finish(), Err(IndexError::BuilderClosed)));
    }

    #[test]
    fn test_finish_twice_fails() {
        let mut builder = SpatialIndexBuilder::new(SpatialConfig::default(), 1).unwrap();
        builder.add(&point(0), 0).unwrap();
        let pending = builder.finish().unwrap();
        assert!(matches!(builder.finish(), Err(IndexError::BuilderClosed)));
        pending.join().unwrap();
    }

    #[test]
    fn test_leaves_respect_capacity() {
        for (n, leaf) in [(1000u64, 64usize), (1025, 32), (7, 2), (5, 1)] {
            let config = SpatialConfig {
                max_points_in_leaf: leaf,
                ..Default::default()
            };
            let handle = build(n, config);
            assert_eq!(handle.point_count(), n as usize);
            assert!(handle.num_leaves().is_power_of_two());
            assert!(handle.max_leaf_len() <= leaf, "n={} leaf={}", n, leaf);
        }
    }

    #[test]
    fn test_flush_to_buffers() {
        let handle = build(300, SpatialConfig::default());
        let (mut meta, mut data, mut index) = (Vec::new(), Vec::new(), Vec::new());
        let written = handle.flush_to(&mut meta, &mut data, &mut index).unwrap();
        assert_eq!(written as usize, meta.len() + data.len() + index.len());
        // 300 records: each carries 72 bytes + a 4-byte doc id.
        assert!(data.len() >= 300 * (RECORD_SIZE + 4));
        assert!(!index.is_empty());
    }

    #[test]
    fn test_flush_to_dir_writes_three_files() {
        let dir = TempDir::new().unwrap();
        let handle = build(100, SpatialConfig::default());
        let artifacts = handle.flush_to_dir(dir.path(), "points").unwrap();
        assert!(artifacts.exists());
        for path in [&artifacts.meta, &artifacts.data, &artifacts.index] {
            assert!(fs::metadata(path).unwrap().len() > 0);
            assert!(!tmp_path(path).exists());
        }
        assert_eq!(artifacts.disk_size().unwrap(), artifacts.bytes_written);
    }

    #[test]
    fn test_empty_index_flushes() {
        let dir = TempDir::new().unwrap();
        let handle = build(0, SpatialConfig::default());
        assert_eq!(handle.num_leaves(), 1);
        let artifacts = handle.flush_to_dir(dir.path(), "empty").unwrap();
        assert!(artifacts.exists());
    }
}
