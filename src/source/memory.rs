//! In-memory mesh source.
//!
//! Holds already-encoded records. Used for synthetic benchmark datasets and
//! for exercising the cursor without the native reader.

use crate::record::{PointRecord, RECORD_SIZE};
use crate::source::{element_aligned_len, Fetch, MeshSource, SourcePosition};

/// Source over a contiguous buffer of encoded records grouped by element.
#[derive(Debug, Clone)]
pub struct MemorySource {
    bytes: Vec<u8>,
    elements: u64,
    restartable: bool,
}

impl MemorySource {
    /// Build from records. Records of one element must be adjacent.
    pub fn from_records(records: &[PointRecord]) -> Self {
        let mut bytes = Vec::with_capacity(records.len() * RECORD_SIZE);
        let mut elements = 0u64;
        let mut last: Option<u64> = None;
        for record in records {
            bytes.extend_from_slice(&record.encode());
            if last != Some(record.element_id) {
                elements += 1;
                last = Some(record.element_id);
            }
        }
        Self {
            bytes,
            elements,
            restartable: true,
        }
    }

    /// Deterministic synthetic dataset: `elements` hexahedra-like cells with
    /// `points_per_element` vertices each, laid out on a unit lattice with
    /// smoothly varying scalar fields.
    pub fn synthetic(elements: u64, points_per_element: u32) -> Self {
        let side = (elements as f64).cbrt().ceil().max(1.0) as u64;
        let mut records = Vec::with_capacity((elements * points_per_element as u64) as usize);
        for element_id in 0..elements {
            let (i, j, k) = (element_id % side, (element_id / side) % side, element_id / (side * side));
            for p in 0..points_per_element as u64 {
                let x = i as f64 + (p & 1) as f64;
                let y = j as f64 + ((p >> 1) & 1) as f64;
                let z = k as f64 + ((p >> 2) & 1) as f64;
                let r2 = x * x + y * y + z * z;
                records.push(PointRecord {
                    x,
                    y,
                    z,
                    e: 1.0 + (r2 * 0.01).sin().abs(),
                    rho: 1.0 / (1.0 + r2),
                    v_x: (y * 0.1).cos(),
                    v_y: (z * 0.1).sin(),
                    v_z: (x * 0.1).sin(),
                    element_id,
                });
            }
        }
        Self::from_records(&records)
    }

    /// Mark the source as forward-only (rewinding is refused).
    pub fn forward_only(mut self) -> Self {
        self.restartable = false;
        self
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.bytes.len() / RECORD_SIZE
    }

    /// Whether the source holds no records.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl MeshSource for MemorySource {
    fn read_batch(&mut self, at: SourcePosition, out: &mut [u8]) -> Fetch {
        let start = at.raw() as usize;
        if start >= self.len() {
            return Fetch::EndOfStream;
        }
        let available = &self.bytes[start * RECORD_SIZE..];
        let count = match element_aligned_len(available, out.len() / RECORD_SIZE) {
            Ok(count) => count,
            Err(e) => return Fetch::Error(e),
        };
        out[..count * RECORD_SIZE].copy_from_slice(&available[..count * RECORD_SIZE]);
        Fetch::MoreData {
            count,
            next: SourcePosition::new((start + count) as u64),
        }
    }

    fn at_end(&self, at: SourcePosition) -> bool {
        at.raw() as usize >= self.len()
    }

    fn num_elements(&self) -> Option<u64> {
        Some(self.elements)
    }

    fn num_points(&self) -> Option<u64> {
        Some(self.len() as u64)
    }

    fn supports_restart(&self) -> bool {
        self.restartable
    }
}
