//! Buffered pull cursor over a mesh source.
//!
//! Crossing into the source is expensive (the native reader walks mesh
//! elements and evaluates grid functions), so the cursor pulls records in
//! large batches and serves them one at a time from a reused buffer.
//!
//! Invariant: `buffer_begin <= read_position <= buffer_begin + buffered_count`.
//! A new batch is fetched exactly when `read_position` reaches the end of the
//! buffer, and the cursor is exhausted exactly when a fetch reports
//! end-of-stream.

use crate::error::{IndexError, Result};
use crate::record::{PointRecord, RECORD_SIZE};
use crate::source::{Fetch, MeshSource, SourcePosition};

/// Default number of records per batch fetch.
pub const DEFAULT_BATCH_SIZE: usize = 64 * 1024;

/// Snapshot of cursor counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorState {
    /// Opaque source position of the next batch.
    pub source_position: SourcePosition,
    /// Stream index of the first buffered record.
    pub buffer_begin: u64,
    /// Records held in the buffer.
    pub buffered_count: u64,
    /// Stream index of the next record to return.
    pub read_position: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Streaming,
    Exhausted,
    Failed,
}

/// Resettable, batch-buffered reader of point records.
pub struct BufferedPointCursor<S: MeshSource> {
    source: S,
    state: CursorState,
    phase: Phase,
    batch_size: usize,
    buffer: Vec<u8>,
    batches_fetched: u64,
}

impl<S: MeshSource> BufferedPointCursor<S> {
    /// Create a cursor with the default batch size.
    pub fn new(source: S) -> Self {
        Self::with_batch_size(source, DEFAULT_BATCH_SIZE)
    }

    /// Create a cursor fetching `batch_size` records per batch (minimum 1).
    pub fn with_batch_size(source: S, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            source,
            state: CursorState::default(),
            phase: Phase::Streaming,
            batch_size,
            buffer: vec![0u8; batch_size * RECORD_SIZE],
            batches_fetched: 0,
        }
    }

    /// Next record, or `None` once the source is exhausted.
    pub fn next(&mut self) -> Result<Option<PointRecord>> {
        Ok(self.next_raw()?.map(PointRecord::decode_raw))
    }

    /// Next record as raw bytes borrowed from the batch buffer.
    pub fn next_raw(&mut self) -> Result<Option<&[u8; RECORD_SIZE]>> {
        match self.phase {
            Phase::Exhausted => return Ok(None),
            Phase::Failed => return Err(IndexError::CursorFailed),
            Phase::Streaming => {}
        }

        if self.state.read_position == self.state.buffer_begin + self.state.buffered_count
            && !self.fetch()?
        {
            return Ok(None);
        }

        let slot = (self.state.read_position - self.state.buffer_begin) as usize;
        self.state.read_position += 1;
        let start = slot * RECORD_SIZE;
        let raw: &[u8; RECORD_SIZE] = self.buffer[start..start + RECORD_SIZE].try_into().unwrap();
        Ok(Some(raw))
    }

    /// Pull one batch. Returns false at end-of-stream.
    fn fetch(&mut self) -> Result<bool> {
        if self.source.at_end(self.state.source_position) {
            self.phase = Phase::Exhausted;
            return Ok(false);
        }

        match self.source.read_batch(self.state.source_position, &mut self.buffer) {
            Fetch::MoreData { count, next } if count > 0 && count <= self.batch_size => {
                self.state.buffer_begin += self.state.buffered_count;
                self.state.buffered_count = count as u64;
                self.state.source_position = next;
                self.batches_fetched += 1;
                tracing::debug!(
                    count,
                    begin = self.state.buffer_begin,
                    "fetched point batch"
                );
                Ok(true)
            }
            Fetch::MoreData { count, .. } => {
                self.phase = Phase::Failed;
                Err(IndexError::SourceRead(format!(
                    "source returned {} records for a batch of {}",
                    count, self.batch_size
                )))
            }
            Fetch::EndOfStream => {
                self.phase = Phase::Exhausted;
                Ok(false)
            }
            Fetch::Error(e) => {
                self.phase = Phase::Failed;
                tracing::debug!(
                    position = self.state.read_position,
                    "source fetch failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Rewind to the first record.
    pub fn reset(&mut self) -> Result<()> {
        if !self.source.supports_restart() {
            return Err(IndexError::UnsupportedReset);
        }
        self.state = CursorState::default();
        self.phase = Phase::Streaming;
        Ok(())
    }

    /// Total records reported by the source, if known.
    pub fn count_hint(&self) -> Option<u64> {
        self.source.num_points()
    }

    /// Current counters.
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Records per batch fetch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches fetched since construction (not cleared by reset).
    pub fn batches_fetched(&self) -> u64 {
        self.batches_fetched
    }

    /// Nothing has been read since construction or the last reset.
    pub fn is_at_start(&self) -> bool {
        self.phase == Phase::Streaming && self.state == CursorState::default()
    }

    /// Whether the last fetch reported end-of-stream.
    pub fn is_exhausted(&self) -> bool {
        self.phase == Phase::Exhausted
    }

    /// Borrow the underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Close the source and hand it back.
    pub fn into_source(mut self) -> Result<S> {
        self.source.close()?;
        Ok(self.source)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
