//! Bulk-loaded block k-d tree over point records.
//!
//! Provides:
//! - `format` -- binary layout of the `.kdm` / `.kdd` / `.kdi` file set
//! - `builder` -- record buffering, background bulk load, flush
//! - `reader` -- checksum-verified loading and box queries

pub mod builder;
pub mod format;
pub mod reader;

pub use builder::{
    DocId, IndexHandle, PendingIndex, SpatialArtifacts, SpatialConfig, SpatialIndexBuilder,
};
pub use format::KdMeta;
pub use reader::{KdIndexReader, KeyRange};
