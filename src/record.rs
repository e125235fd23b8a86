//! Fixed-size binary point records.
//!
//! One record is a single mesh vertex sample as emitted by the Laghos
//! exporter: position, energy, density, velocity and the owning element.
//!
//! ```text
//! Offset  Size  Field
//! 0       8     x: f64
//! 8       8     y: f64
//! 16      8     z: f64
//! 24      8     e: f64
//! 32      8     rho: f64
//! 40      8     v_x: f64
//! 48      8     v_y: f64
//! 56      8     v_z: f64
//! 64      8     element_id: u64
//! ```
//!
//! All fields are little-endian. Encoding is bit-exact, so NaN payloads and
//! signed zeros survive a round trip.

use crate::error::{IndexError, Result};

/// Size of one encoded record in bytes.
pub const RECORD_SIZE: usize = 72;

/// Number of addressable dimensions in a record (8 floats + element id).
pub const NUM_DIMS: usize = 9;

/// Number of float dimensions that may be projected into key-value keys.
pub const NUM_FLOAT_DIMS: usize = 8;

/// Width of a single dimension value in bytes.
pub const DIM_WIDTH: usize = 8;

/// Byte offset of the element id.
const ELEMENT_ID_OFFSET: usize = 64;

/// Dimension names in declaration order.
pub const DIMENSION_NAMES: [&str; NUM_DIMS] =
    ["x", "y", "z", "e", "rho", "v_x", "v_y", "v_z", "element_id"];

// ── PointRecord ─────────────────────────────────────────────────────

/// One decoded point sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointRecord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Specific internal energy.
    pub e: f64,
    /// Density.
    pub rho: f64,
    pub v_x: f64,
    pub v_y: f64,
    pub v_z: f64,
    /// Mesh element this vertex belongs to.
    pub element_id: u64,
}

/// Bit-level equality: two records are equal when their encodings are.
impl PartialEq for PointRecord {
    fn eq(&self, other: &Self) -> bool {
        self.encode() == other.encode()
    }
}

impl Eq for PointRecord {}

impl PointRecord {
    fn floats(&self) -> [f64; NUM_FLOAT_DIMS] {
        [
            self.x, self.y, self.z, self.e, self.rho, self.v_x, self.v_y, self.v_z,
        ]
    }

    /// Encode into a fresh 72-byte array.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        self.encode_into(&mut out);
        out
    }

    /// Encode into a caller-owned buffer.
    pub fn encode_into(&self, out: &mut [u8; RECORD_SIZE]) {
        for (i, value) in self.floats().iter().enumerate() {
            out[i * DIM_WIDTH..(i + 1) * DIM_WIDTH].copy_from_slice(&value.to_le_bytes());
        }
        out[ELEMENT_ID_OFFSET..].copy_from_slice(&self.element_id.to_le_bytes());
    }

    /// Decode a record. Fails unless `bytes` is exactly 72 bytes long.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw: &[u8; RECORD_SIZE] = bytes
            .try_into()
            .map_err(|_| IndexError::MalformedRecord { len: bytes.len() })?;
        Ok(Self::decode_raw(raw))
    }

    /// Decode from an array that is statically the right size.
    pub fn decode_raw(raw: &[u8; RECORD_SIZE]) -> Self {
        let f = |dim: usize| f64::from_le_bytes(dimension_bytes(raw, dim));
        Self {
            x: f(0),
            y: f(1),
            z: f(2),
            e: f(3),
            rho: f(4),
            v_x: f(5),
            v_y: f(6),
            v_z: f(7),
            element_id: element_id_of(raw),
        }
    }
}

// ── Dimension access on raw records ─────────────────────────────────

/// Raw 8 bytes of dimension `dim` (0..9).
///
/// Panics if `dim >= NUM_DIMS`; callers validate dimension counts up front.
#[inline]
pub fn dimension_bytes(raw: &[u8; RECORD_SIZE], dim: usize) -> [u8; DIM_WIDTH] {
    let start = dim * DIM_WIDTH;
    let mut out = [0u8; DIM_WIDTH];
    out.copy_from_slice(&raw[start..start + DIM_WIDTH]);
    out
}

/// Element id of a raw record without decoding the floats.
#[inline]
pub fn element_id_of(raw: &[u8]) -> u64 {
    let mut out = [0u8; DIM_WIDTH];
    out.copy_from_slice(&raw[ELEMENT_ID_OFFSET..ELEMENT_ID_OFFSET + DIM_WIDTH]);
    u64::from_le_bytes(out)
}

/// Map an f64 to a u64 whose unsigned order matches `f64::total_cmp`.
#[inline]
pub fn sortable_f64(value: f64) -> u64 {
    let bits = value.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// Inverse of [`sortable_f64`].
#[inline]
pub fn unsortable_f64(key: u64) -> f64 {
    if key >> 63 == 1 {
        f64::from_bits(key & !(1 << 63))
    } else {
        f64::from_bits(!key)
    }
}

/// Order-preserving key for dimension `dim` of a raw record.
#[inline]
pub fn sortable_key(raw: &[u8; RECORD_SIZE], dim: usize) -> u64 {
    let value = u64::from_le_bytes(dimension_bytes(raw, dim));
    if dim < NUM_FLOAT_DIMS {
        sortable_f64(f64::from_bits(value))
    } else {
        value
    }
}

// ── Tests ──────────────────────────────────────────────────────────
