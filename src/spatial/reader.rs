//! Read-only access to a flushed k-d tree file set.
//!
//! Opening validates headers, lengths and BLAKE3 checksums of the data and
//! index files against the metadata. Queries walk the heap-ordered tree and
//! scan only the leaves whose cells intersect the query box.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{IndexError, Result};
use crate::record::{sortable_f64, sortable_key, RECORD_SIZE};
use crate::spatial::builder::{DocId, SpatialArtifacts};
use crate::spatial::format::{
    check_file_header, compute_padding, KdMeta, DATA_MAGIC, FILE_HEADER_SIZE, INDEX_MAGIC,
};

/// Inclusive range over sortable keys of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub min: u64,
    pub max: u64,
}

impl KeyRange {
    /// Range covering every value.
    pub const ALL: KeyRange = KeyRange {
        min: 0,
        max: u64::MAX,
    };

    /// Inclusive range over float values.
    pub fn f64(min: f64, max: f64) -> Self {
        Self {
            min: sortable_f64(min),
            max: sortable_f64(max),
        }
    }

    fn contains(&self, key: u64) -> bool {
        self.min <= key && key <= self.max
    }
}

/// Opened k-d tree.
pub struct KdIndexReader {
    meta: KdMeta,
    data: Mmap,
    split_dims: Vec<u8>,
    split_values: Vec<u64>,
    leaf_fps: Vec<u64>,
    leaf_counts: Vec<u32>,
}

fn map_checked(path: &Path, expected_len: u64, checksum: &[u8; 32], what: &str) -> Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: index files are immutable once flushed.
    let mmap = unsafe { Mmap::map(&file)? };
    if mmap.len() as u64 != expected_len {
        return Err(IndexError::InvalidFormat(format!(
            "{} file is {} bytes, metadata says {}",
            what,
            mmap.len(),
            expected_len
        )));
    }
    if blake3::hash(&mmap).as_bytes() != checksum {
        return Err(IndexError::InvalidFormat(format!("{} checksum mismatch", what)));
    }
    Ok(mmap)
}

impl KdIndexReader {
    /// Open the file set `base` in `dir`.
    pub fn open(dir: &Path, base: &str) -> Result<Self> {
        let paths = SpatialArtifacts::paths(dir, base);
        let meta = KdMeta::read_from(&mut BufReader::new(File::open(&paths.meta)?))?;

        let data = map_checked(&paths.data, meta.data_length, &meta.data_checksum, "data")?;
        check_file_header(&data, DATA_MAGIC, "data")?;
        let index = map_checked(&paths.index, meta.index_length, &meta.index_checksum, "index")?;
        check_file_header(&index, INDEX_MAGIC, "index")?;

        let leaves = meta.num_leaves as usize;
        if leaves == 0 || !leaves.is_power_of_two() {
            return Err(IndexError::InvalidFormat(format!(
                "leaf count {} is not a power of two",
                leaves
            )));
        }
        let inner = leaves - 1;
        let dims_end = FILE_HEADER_SIZE + inner;
        let values_start = dims_end + compute_padding(inner, 8);
        let fps_start = values_start + 8 * inner;
        let counts_start = fps_start + 8 * leaves;
        let expected = counts_start + 4 * leaves;
        if index.len() != expected {
            return Err(IndexError::InvalidFormat(format!(
                "index file is {} bytes, expected {}",
                index.len(),
                expected
            )));
        }

        let u64s = |start: usize, n: usize| -> Vec<u64> {
            index[start..start + 8 * n]
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                .collect()
        };
        let split_dims = index[FILE_HEADER_SIZE..dims_end].to_vec();
        if let Some(&bad) = split_dims.iter().find(|&&d| d as u32 >= meta.num_index_dims) {
            return Err(IndexError::InvalidFormat(format!(
                "split dimension {} is not indexed",
                bad
            )));
        }
        let split_values = u64s(values_start, inner);
        let leaf_fps = u64s(fps_start, leaves);
        let leaf_counts: Vec<u32> = index[counts_start..expected]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        for (&fp, &count) in leaf_fps.iter().zip(&leaf_counts) {
            let end = fp + 4 + count as u64 * (4 + RECORD_SIZE as u64);
            if end > meta.data_length {
                return Err(IndexError::InvalidFormat(format!(
                    "leaf at {} runs past the data file",
                    fp
                )));
            }
        }

        Ok(Self {
            meta,
            data,
            split_dims,
            split_values,
            leaf_fps,
            leaf_counts,
        })
    }

    pub fn meta(&self) -> &KdMeta {
        &self.meta
    }

    pub fn point_count(&self) -> u64 {
        self.meta.point_count
    }

    /// Points in each leaf, in leaf order.
    pub fn leaf_counts(&self) -> &[u32] {
        &self.leaf_counts
    }

    /// Doc ids of every point inside `bounds` (one range per indexed dimension).
    pub fn range_query(&self, bounds: &[KeyRange]) -> Result<Vec<DocId>> {
        if bounds.len() != self.meta.num_index_dims as usize {
            return Err(IndexError::InvalidConfig(format!(
                "query has {} ranges, index has {} dimensions",
                bounds.len(),
                self.meta.num_index_dims
            )));
        }
        let mut hits = Vec::new();
        self.visit(1, bounds, &mut hits);
        Ok(hits)
    }

    fn visit(&self, node: usize, bounds: &[KeyRange], hits: &mut Vec<DocId>) {
        let leaves = self.leaf_counts.len();
        if node >= leaves {
            self.scan_leaf(node - leaves, bounds, hits);
            return;
        }
        let dim = self.split_dims[node - 1] as usize;
        let value = self.split_values[node - 1];
        if bounds[dim].min <= value {
            self.visit(2 * node, bounds, hits);
        }
        if bounds[dim].max >= value {
            self.visit(2 * node + 1, bounds, hits);
        }
    }

    fn scan_leaf(&self, leaf: usize, bounds: &[KeyRange], hits: &mut Vec<DocId>) {
        let count = self.leaf_counts[leaf] as usize;
        let ids_start = self.leaf_fps[leaf] as usize + 4;
        let records_start = ids_start + 4 * count;
        for i in 0..count {
            let at = records_start + i * RECORD_SIZE;
            let raw: &[u8; RECORD_SIZE] = self.data[at..at + RECORD_SIZE].try_into().unwrap();
            if bounds
                .iter()
                .enumerate()
                .all(|(dim, range)| range.contains(sortable_key(raw, dim)))
            {
                let id_at = ids_start + 4 * i;
                hits.push(DocId::from_le_bytes(
                    self.data[id_at..id_at + 4].try_into().unwrap(),
                ));
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PointRecord;
    use crate::spatial::builder::{SpatialConfig, SpatialIndexBuilder};
    use tempfile::TempDir;

    fn records(n: u64) -> Vec<PointRecord> {
        (0..n)
            .map(|i| PointRecord {
                x: ((i * 37) % 101) as f64 - 50.0,
                y: ((i * 53) % 89) as f64 * 0.25,
                z: (i % 13) as f64,
                rho: i as f64,
                element_id: i / 8,
                ..Default::default()
            })
            .collect()
    }

    fn write_index(dir: &Path, records: &[PointRecord], config: SpatialConfig) {
        let mut builder = SpatialIndexBuilder::new(config, records.len() as u64).unwrap();
        for (i, r) in records.iter().enumerate() {
            builder.add(&r.encode(), i as DocId).unwrap();
        }
        let handle = builder.finish().unwrap().join().unwrap();
        handle.flush_to_dir(dir, "mesh").unwrap();
    }

    #[test]
    fn test_full_range_returns_everything() {
        let dir = TempDir::new().unwrap();
        let input = records(2000);
        let config = SpatialConfig {
            max_points_in_leaf: 50,
            ..Default::default()
        };
        write_index(dir.path(), &input, config);

        let reader = KdIndexReader::open(dir.path(), "mesh").unwrap();
        assert_eq!(reader.point_count(), 2000);
        assert!(reader.leaf_counts().iter().all(|&c| c <= 50));

        let mut ids = reader.range_query(&[KeyRange::ALL; 3]).unwrap();
        ids.sort_unstable();
        assert_eq!(ids, (0..2000).collect::<Vec<DocId>>());
    }

    #[test]
    fn test_box_query_matches_brute_force() {
        let dir = TempDir::new().unwrap();
        let input = records(3000);
        let config = SpatialConfig {
            num_index_dims: 2,
            max_points_in_leaf: 64,
            ..Default::default()
        };
        write_index(dir.path(), &input, config);
        let reader = KdIndexReader::open(dir.path(), "mesh").unwrap();

        let (x_lo, x_hi, y_lo, y_hi) = (-10.0, 20.0, 3.0, 11.5);
        let mut got = reader
            .range_query(&[KeyRange::f64(x_lo, x_hi), KeyRange::f64(y_lo, y_hi)])
            .unwrap();
        got.sort_unstable();

        let expected: Vec<DocId> = input
            .iter()
            .enumerate()
            .filter(|(_, r)| r.x >= x_lo && r.x <= x_hi && r.y >= y_lo && r.y <= y_hi)
            .map(|(i, _)| i as DocId)
            .collect();
        assert!(!expected.is_empty());
        assert_eq!(got, expected);
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        write_index(dir.path(), &records(10), SpatialConfig::default());
        let reader = KdIndexReader::open(dir.path(), "mesh").unwrap();
        assert!(reader.range_query(&[KeyRange::ALL]).is_err());
    }

    #[test]
    fn test_corrupt_data_detected() {
        let dir = TempDir::new().unwrap();
        write_index(dir.path(), &records(100), SpatialConfig::default());
        let paths = SpatialArtifacts::paths(dir.path(), "mesh");
        let mut bytes = std::fs::read(&paths.data).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&paths.data, bytes).unwrap();

        let err = KdIndexReader::open(dir.path(), "mesh").err().unwrap();
        assert!(matches!(err, IndexError::InvalidFormat(_)));
    }

    #[test]
    fn test_missing_meta_is_not_an_index() {
        let dir = TempDir::new().unwrap();
        write_index(dir.path(), &records(10), SpatialConfig::default());
        std::fs::remove_file(SpatialArtifacts::paths(dir.path(), "mesh").meta).unwrap();
        assert!(KdIndexReader::open(dir.path(), "mesh").is_err());
    }
}
