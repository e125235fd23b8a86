//! Flat point files: a dataset exported to packed 72-byte records.
//!
//! ```text
//! [PointFileHeader]        32 bytes
//! [record] * record_count  72 bytes each, grouped by element
//! ```
//!
//! Header layout:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic: b"MPTS"
//! 4       4     version: u32 = 1
//! 8       8     record_count: u64
//! 16      8     element_count: u64
//! 24      8     _reserved
//! ```

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{IndexError, Result};
use crate::record::{PointRecord, RECORD_SIZE};
use crate::source::{element_aligned_len, Fetch, MeshSource, SourcePosition};

/// Magic bytes for point files.
pub const POINT_FILE_MAGIC: [u8; 4] = *b"MPTS";

/// Point file format version.
pub const POINT_FILE_VERSION: u32 = 1;

const HEADER_SIZE: usize = 32;

/// Memory-mapped point file source.
pub struct PointFileSource {
    mmap: Option<Mmap>,
    record_count: u64,
    element_count: u64,
}

impl PointFileSource {
    /// Map a point file and validate its header and length.
    pub fn open(path: &Path) -> Result<Self> {
        let open_err = |reason: String| IndexError::SourceOpen {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| open_err(e.to_string()))?;
        // SAFETY: the file is opened read-only and not modified while mapped.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| open_err(e.to_string()))?;

        if mmap.len() < HEADER_SIZE || mmap[0..4] != POINT_FILE_MAGIC {
            return Err(open_err("not a point file".to_string()));
        }
        let version = u32::from_le_bytes(mmap[4..8].try_into().unwrap());
        if version != POINT_FILE_VERSION {
            return Err(open_err(format!("unsupported point file version {}", version)));
        }
        let record_count = u64::from_le_bytes(mmap[8..16].try_into().unwrap());
        let element_count = u64::from_le_bytes(mmap[16..24].try_into().unwrap());

        let expected = HEADER_SIZE as u64 + record_count * RECORD_SIZE as u64;
        if mmap.len() as u64 != expected {
            return Err(open_err(format!(
                "length {} does not match {} records",
                mmap.len(),
                record_count
            )));
        }

        Ok(Self {
            mmap: Some(mmap),
            record_count,
            element_count,
        })
    }
}

impl MeshSource for PointFileSource {
    fn read_batch(&mut self, at: SourcePosition, out: &mut [u8]) -> Fetch {
        let Some(mmap) = &self.mmap else {
            return Fetch::Error(IndexError::SourceRead("point file is closed".to_string()));
        };
        if at.raw() >= self.record_count {
            return Fetch::EndOfStream;
        }
        let start = HEADER_SIZE + at.raw() as usize * RECORD_SIZE;
        let available = &mmap[start..];
        let count = match element_aligned_len(available, out.len() / RECORD_SIZE) {
            Ok(count) => count,
            Err(e) => return Fetch::Error(e),
        };
        out[..count * RECORD_SIZE].copy_from_slice(&available[..count * RECORD_SIZE]);
        Fetch::MoreData {
            count,
            next: SourcePosition::new(at.raw() + count as u64),
        }
    }

    fn at_end(&self, at: SourcePosition) -> bool {
        at.raw() >= self.record_count
    }

    fn num_elements(&self) -> Option<u64> {
        Some(self.element_count)
    }

    fn num_points(&self) -> Option<u64> {
        Some(self.record_count)
    }

    fn close(&mut self) -> Result<()> {
        self.mmap = None;
        Ok(())
    }
}

/// Write records to a point file. Returns the number of records written.
///
/// The header counts are patched in after the records, so `records` may be
/// any iterator, including a fallible one fed from a cursor.
pub fn write_point_file<I>(path: &Path, records: I) -> Result<u64>
where
    I: IntoIterator<Item = Result<PointRecord>>,
{
    let mut writer = BufWriter::new(File::create(path)?);

    // Header with placeholder counts.
    writer.write_all(&POINT_FILE_MAGIC)?;
    writer.write_all(&POINT_FILE_VERSION.to_le_bytes())?;
    writer.write_all(&[0u8; 24])?;

    let mut record_count = 0u64;
    let mut element_count = 0u64;
    let mut last_element: Option<u64> = None;
    for record in records {
        let record = record?;
        writer.write_all(&record.encode())?;
        record_count += 1;
        if last_element != Some(record.element_id) {
            element_count += 1;
            last_element = Some(record.element_id);
        }
    }

    writer.seek(SeekFrom::Start(8))?;
    writer.write_all(&record_count.to_le_bytes())?;
    writer.write_all(&element_count.to_le_bytes())?;
    writer.flush()?;

    Ok(record_count)
}
