//! Mesh sources: the narrow capability interface over point producers.
//!
//! A source hands out batches of encoded point records. Positions are
//! opaque value types: each fetch takes the current position and returns the
//! next one, so the caller never shares a mutable iterator with the source.
//!
//! Every adapter batches whole mesh elements only. The points of one element
//! never straddle two fetches, matching the native reader.

pub mod memory;
pub mod point_file;
#[cfg(feature = "mfem")]
pub mod laghos;

use std::path::{Path, PathBuf};

use crate::error::{IndexError, Result};
use crate::record::{element_id_of, RECORD_SIZE};

pub use memory::MemorySource;
pub use point_file::{write_point_file, PointFileSource};
#[cfg(feature = "mfem")]
pub use laghos::LaghosSource;

// ── SourcePosition ──────────────────────────────────────────────────

/// Opaque position inside a source. Only the source advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePosition(u64);

impl SourcePosition {
    /// The origin of every source.
    pub const START: SourcePosition = SourcePosition(0);

    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

// ── Fetch ───────────────────────────────────────────────────────────

/// Outcome of one batch fetch.
///
/// End-of-stream and failures are separate states; a zero count is never
/// used to signal either.
#[derive(Debug)]
pub enum Fetch {
    /// `count` records (1..=capacity) were written to the front of the buffer.
    MoreData { count: usize, next: SourcePosition },
    /// Iteration is complete.
    EndOfStream,
    /// The source failed while reading.
    Error(IndexError),
}

// ── MeshSource ──────────────────────────────────────────────────────

/// Batch-read interface over an external point producer.
pub trait MeshSource: Send {
    /// Read up to `out.len() / RECORD_SIZE` records starting at `at`.
    fn read_batch(&mut self, at: SourcePosition, out: &mut [u8]) -> Fetch;

    /// Whether `at` is past the last element.
    fn at_end(&self, at: SourcePosition) -> bool;

    /// Number of mesh elements, if the source knows it.
    fn num_elements(&self) -> Option<u64>;

    /// Number of points, if the source knows it. Advisory only.
    fn num_points(&self) -> Option<u64>;

    /// Whether reading may restart from `SourcePosition::START`.
    fn supports_restart(&self) -> bool {
        true
    }

    /// Release the underlying handle. Further reads fail.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: MeshSource + ?Sized> MeshSource for Box<S> {
    fn read_batch(&mut self, at: SourcePosition, out: &mut [u8]) -> Fetch {
        (**self).read_batch(at, out)
    }

    fn at_end(&self, at: SourcePosition) -> bool {
        (**self).at_end(at)
    }

    fn num_elements(&self) -> Option<u64> {
        (**self).num_elements()
    }

    fn num_points(&self) -> Option<u64> {
        (**self).num_points()
    }

    fn supports_restart(&self) -> bool {
        (**self).supports_restart()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

// ── Element-aligned batching ────────────────────────────────────────

/// Number of records from the front of `available` that fit in `capacity`
/// without splitting an element.
///
/// `available` holds encoded records grouped by element id. Returns an error
/// when the first element alone exceeds `capacity`, since no progress would
/// be possible.
pub(crate) fn element_aligned_len(available: &[u8], capacity: usize) -> Result<usize> {
    let total = available.len() / RECORD_SIZE;
    if total <= capacity {
        return Ok(total);
    }
    if capacity == 0 {
        return Err(IndexError::SourceRead("batch buffer has no capacity".to_string()));
    }

    // Element boundary: walk back from the record just past the window.
    let boundary_id = element_id_of(record_at(available, capacity));
    let mut len = capacity;
    while len > 0 && element_id_of(record_at(available, len - 1)) == boundary_id {
        len -= 1;
    }
    if len == 0 {
        return Err(IndexError::SourceRead(format!(
            "element {} has more points than the batch capacity of {}",
            boundary_id, capacity
        )));
    }
    Ok(len)
}

fn record_at(buf: &[u8], index: usize) -> &[u8] {
    &buf[index * RECORD_SIZE..(index + 1) * RECORD_SIZE]
}

// ── Dataset file layout ─────────────────────────────────────────────

/// The four files of a Laghos dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaghosFiles {
    pub mesh: PathBuf,
    pub e: PathBuf,
    pub rho: PathBuf,
    pub v: PathBuf,
}

impl LaghosFiles {
    /// Resolve the conventional layout: `<dir>/mesh`, `<dir>/e`, `<dir>/rho`, `<dir>/v`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            mesh: dir.join("mesh"),
            e: dir.join("e"),
            rho: dir.join("rho"),
            v: dir.join("v"),
        }
    }

    /// Fail with `SourceOpen` naming the first missing file.
    pub fn check_exist(&self) -> Result<()> {
        for path in [&self.mesh, &self.e, &self.rho, &self.v] {
            if !path.is_file() {
                return Err(IndexError::SourceOpen {
                    path: path.clone(),
                    reason: "file not found".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PointRecord;

    fn encode_ids(ids: &[u64]) -> Vec<u8> {
        ids.iter()
            .flat_map(|&id| {
                PointRecord {
                    element_id: id,
                    ..Default::default()
                }
                .encode()
            })
            .collect()
    }

    #[test]
    fn test_aligned_len_everything_fits() {
        let buf = encode_ids(&[0, 0, 1, 1]);
        assert_eq!(element_aligned_len(&buf, 8).unwrap(), 4);
    }

    #[test]
    fn test_aligned_len_backs_off_to_element_boundary() {
        let buf = encode_ids(&[0, 0, 0, 1, 1, 1, 2, 2, 2]);
        // Window of 5 would cut element 1 in half.
        assert_eq!(element_aligned_len(&buf, 5).unwrap(), 3);
        assert_eq!(element_aligned_len(&buf, 6).unwrap(), 6);
    }

    #[test]
    fn test_aligned_len_element_larger_than_capacity() {
        let buf = encode_ids(&[4, 4, 4, 4, 5]);
        let err = element_aligned_len(&buf, 3).unwrap_err();
        assert!(matches!(err, IndexError::SourceRead(_)));
    }

    #[test]
    fn test_laghos_files_in_dir() {
        let files = LaghosFiles::in_dir(Path::new("/data/run1"));
        assert_eq!(files.rho, PathBuf::from("/data/run1/rho"));
        let err = files.check_exist().unwrap_err();
        assert_eq!(err.code(), "SOURCE_OPEN");
    }
}
