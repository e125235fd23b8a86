//! Binary format of the block k-d tree file set.
//!
//! Three files share a base name:
//!
//! ```text
//! <base>.kdm   metadata: KdMeta (dimensions, counts, bounds, checksums)
//! <base>.kdd   data: file header + leaf blocks
//! <base>.kdi   index: file header + tree arrays in heap order
//! ```
//!
//! Data leaf block:
//!
//! ```text
//! [count: u32]
//! [doc_id: u32] * count
//! [record: 72 bytes] * count
//! ```
//!
//! Index body (`L` = num_leaves, a power of two; inner node `n` is 1..L,
//! leaf node `n` is L..2L):
//!
//! ```text
//! [split_dim: u8] * (L - 1), zero-padded to 8 bytes
//! [split_value: u64] * (L - 1)
//! [leaf_fp: u64] * L        byte offset of the leaf block in .kdd
//! [leaf_count: u32] * L
//! ```

use std::io::{Read, Write};

use crate::error::{IndexError, Result};

/// Extension of the metadata file.
pub const META_EXTENSION: &str = "kdm";
/// Extension of the data file.
pub const DATA_EXTENSION: &str = "kdd";
/// Extension of the index file.
pub const INDEX_EXTENSION: &str = "kdi";

/// Magic bytes for each file.
pub const META_MAGIC: [u8; 4] = *b"KDM1";
pub const DATA_MAGIC: [u8; 4] = *b"KDD1";
pub const INDEX_MAGIC: [u8; 4] = *b"KDI1";

/// Format version shared by the three files.
pub const KD_VERSION: u32 = 1;

/// Size of the magic + version prefix of data and index files.
pub const FILE_HEADER_SIZE: usize = 8;

/// Fixed part of the metadata file, before the per-dimension bounds.
pub const META_FIXED_SIZE: usize = 112;

/// Write the 8-byte magic/version prefix.
pub fn write_file_header<W: Write>(w: &mut W, magic: [u8; 4]) -> Result<()> {
    w.write_all(&magic)?;
    w.write_all(&KD_VERSION.to_le_bytes())?;
    Ok(())
}

/// Check the 8-byte magic/version prefix of a mapped file.
pub fn check_file_header(buf: &[u8], magic: [u8; 4], what: &str) -> Result<()> {
    if buf.len() < FILE_HEADER_SIZE || buf[0..4] != magic {
        return Err(IndexError::InvalidFormat(format!(
            "Not a k-d tree {} file",
            what
        )));
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if version != KD_VERSION {
        return Err(IndexError::InvalidFormat(format!(
            "Unsupported k-d tree {} version: {}",
            what, version
        )));
    }
    Ok(())
}

/// Bytes of zero padding after `len` bytes to reach `align`.
pub fn compute_padding(len: usize, align: usize) -> usize {
    (align - len % align) % align
}

// ── KdMeta ──────────────────────────────────────────────────────────

/// Contents of the metadata file.
///
/// ```text
/// Offset  Size  Field
/// 0       4     magic: b"KDM1"
/// 4       4     version: u32 = 1
/// 8       4     num_dims: u32
/// 12      4     num_index_dims: u32
/// 16      4     max_points_in_leaf: u32
/// 20      4     num_leaves: u32
/// 24      8     point_count: u64
/// 32      8     data_length: u64
/// 40      8     index_length: u64
/// 48      32    data_checksum: blake3
/// 80      32    index_checksum: blake3
/// 112     8*K   min_keys: u64 (sortable)
/// 112+8K  8*K   max_keys: u64 (sortable)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdMeta {
    pub num_dims: u32,
    pub num_index_dims: u32,
    pub max_points_in_leaf: u32,
    pub num_leaves: u32,
    pub point_count: u64,
    pub data_length: u64,
    pub index_length: u64,
    pub data_checksum: [u8; 32],
    pub index_checksum: [u8; 32],
    /// Per indexed dimension, smallest sortable key.
    pub min_keys: Vec<u64>,
    /// Per indexed dimension, largest sortable key.
    pub max_keys: Vec<u64>,
}

impl KdMeta {
    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        META_FIXED_SIZE + 16 * self.num_index_dims as usize
    }

    /// Write metadata (little-endian).
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_file_header(w, META_MAGIC)?;
        w.write_all(&self.num_dims.to_le_bytes())?;
        w.write_all(&self.num_index_dims.to_le_bytes())?;
        w.write_all(&self.max_points_in_leaf.to_le_bytes())?;
        w.write_all(&self.num_leaves.to_le_bytes())?;
        w.write_all(&self.point_count.to_le_bytes())?;
        w.write_all(&self.data_length.to_le_bytes())?;
        w.write_all(&self.index_length.to_le_bytes())?;
        w.write_all(&self.data_checksum)?;
        w.write_all(&self.index_checksum)?;
        for key in self.min_keys.iter().chain(&self.max_keys) {
            w.write_all(&key.to_le_bytes())?;
        }
        Ok(())
    }

    /// Read metadata and validate magic, version and dimension counts.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; META_FIXED_SIZE];
        r.read_exact(&mut buf).map_err(|e| {
            IndexError::InvalidFormat(format!("Failed to read k-d tree metadata: {}", e))
        })?;
        check_file_header(&buf, META_MAGIC, "metadata")?;

        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());

        let num_dims = u32_at(8);
        let num_index_dims = u32_at(12);
        if num_index_dims == 0 || num_index_dims > num_dims {
            return Err(IndexError::InvalidFormat(format!(
                "Invalid indexed dimension count {} of {}",
                num_index_dims, num_dims
            )));
        }

        let mut data_checksum = [0u8; 32];
        data_checksum.copy_from_slice(&buf[48..80]);
        let mut index_checksum = [0u8; 32];
        index_checksum.copy_from_slice(&buf[80..112]);

        let k = num_index_dims as usize;
        let mut bounds = vec![0u8; 16 * k];
        r.read_exact(&mut bounds).map_err(|e| {
            IndexError::InvalidFormat(format!("Failed to read k-d tree bounds: {}", e))
        })?;
        let keys: Vec<u64> = bounds
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        Ok(Self {
            num_dims,
            num_index_dims,
            max_points_in_leaf: u32_at(16),
            num_leaves: u32_at(20),
            point_count: u64_at(24),
            data_length: u64_at(32),
            index_length: u64_at(40),
            data_checksum,
            index_checksum,
            min_keys: keys[..k].to_vec(),
            max_keys: keys[k..].to_vec(),
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────
