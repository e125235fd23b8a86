//! Redundant single-dimension index in RocksDB.
//!
//! Each indexed dimension gets its own column family named after the
//! dimension (`x`, `y`, ..., `v_z`). For every record, `fanout` entries are
//! written, one per leading dimension:
//!
//! ```text
//! key   = raw 8 bytes of dimension i (as stored in the record)
//!         ++ record ordinal, u64 big-endian
//! value = element_id, u64 little-endian
//! ```
//!
//! Mesh vertices are shared between elements, so one coordinate value
//! repeats across many records. The ordinal suffix keeps every record's
//! entry distinct, and equal values stay adjacent in arrival order.
//!
//! Fanout 1 ("uni") indexes only `x`. Fanout 8 ("multi") writes every float
//! dimension, trading write amplification for per-dimension lookups in an
//! engine that orders by a single key.

use std::path::{Path, PathBuf};

use rocksdb::{BlockBasedOptions, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::record::{dimension_bytes, PointRecord, DIMENSION_NAMES, DIM_WIDTH, NUM_FLOAT_DIMS};

/// Width of a store key: dimension bytes plus the record ordinal.
pub const KEY_WIDTH: usize = DIM_WIDTH + 8;

/// Store key for dimension bytes `value` of the record at `ordinal`.
pub fn entry_key(value: [u8; DIM_WIDTH], ordinal: u64) -> [u8; KEY_WIDTH] {
    let mut key = [0u8; KEY_WIDTH];
    key[..DIM_WIDTH].copy_from_slice(&value);
    key[DIM_WIDTH..].copy_from_slice(&ordinal.to_be_bytes());
    key
}

/// Store tuning and fanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Dimensions projected per record (1..=8).
    pub fanout: usize,
    /// Memtable size in bytes.
    pub write_buffer_size: usize,
    /// SST block size in bytes.
    pub block_size: usize,
    /// Skip the write-ahead log; durability comes from the flush in `close()`.
    pub disable_wal: bool,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            fanout: 1,
            write_buffer_size: 64 * 1024 * 1024,
            block_size: 16 * 1024,
            disable_wal: true,
        }
    }
}

impl KvConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fanout == 0 || self.fanout > NUM_FLOAT_DIMS {
            return Err(IndexError::InvalidConfig(format!(
                "fanout must be in 1..={}, got {}",
                NUM_FLOAT_DIMS, self.fanout
            )));
        }
        if self.write_buffer_size == 0 || self.block_size == 0 {
            return Err(IndexError::InvalidConfig(
                "write_buffer_size and block_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Column families written with this fanout.
    pub fn column_families(&self) -> &'static [&'static str] {
        let names: &'static [&'static str; 9] = &DIMENSION_NAMES;
        &names[..self.fanout.min(NUM_FLOAT_DIMS)]
    }

    fn db_options(&self) -> Options {
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_size(self.block_size);

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(self.write_buffer_size);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }
}

/// Counters reported by `close()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KvStats {
    /// Records passed to `put`.
    pub records: u64,
    /// Individual key/value writes issued.
    pub puts: u64,
}

/// Writes record projections into a RocksDB directory.
pub struct KeyValueIndexBuilder {
    db: Option<DB>,
    path: PathBuf,
    config: KvConfig,
    write_opts: WriteOptions,
    stats: KvStats,
}

impl KeyValueIndexBuilder {
    /// Open or create the store at `path`.
    pub fn open(path: &Path, config: KvConfig) -> Result<Self> {
        config.validate()?;
        let db = DB::open_cf(&config.db_options(), path, config.column_families())?;

        let mut write_opts = WriteOptions::default();
        write_opts.disable_wal(config.disable_wal);

        tracing::debug!(path = %path.display(), fanout = config.fanout, "opened key-value store");
        Ok(Self {
            db: Some(db),
            path: path.to_path_buf(),
            config,
            write_opts,
            stats: KvStats::default(),
        })
    }

    /// Write `fanout` entries for one record as a single batch.
    pub fn put(&mut self, record: &PointRecord) -> Result<()> {
        let db = self.db.as_ref().ok_or(IndexError::BuilderClosed)?;
        let raw = record.encode();
        let ordinal = self.stats.records;
        let value = record.element_id.to_le_bytes();

        let mut batch = WriteBatch::default();
        for (dim, name) in self.config.column_families().iter().enumerate() {
            let cf = db.cf_handle(name).ok_or_else(|| {
                IndexError::StoreUnavailable(format!("column family {} missing", name))
            })?;
            batch.put_cf(cf, entry_key(dimension_bytes(&raw, dim), ordinal), value);
        }
        db.write_opt(batch, &self.write_opts)?;

        self.stats.records += 1;
        self.stats.puts += self.config.fanout as u64;
        Ok(())
    }

    pub fn stats(&self) -> KvStats {
        self.stats
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush every column family and close the store. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<KvStats> {
        if let Some(db) = self.db.take() {
            for name in self.config.column_families() {
                if let Some(cf) = db.cf_handle(name) {
                    db.flush_cf(cf)?;
                }
            }
            drop(db);
            tracing::debug!(
                path = %self.path.display(),
                records = self.stats.records,
                puts = self.stats.puts,
                "closed key-value store"
            );
        }
        Ok(self.stats)
    }
}

impl Drop for KeyValueIndexBuilder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing key-value store {}: {}", self.path.display(), e);
        }
    }
}

/// Count entries across every dimension column family of a closed store.
pub fn count_store_entries(path: &Path) -> Result<u64> {
    let opts = Options::default();
    let families: Vec<String> = DB::list_cf(&opts, path)?
        .into_iter()
        .filter(|name| name != "default")
        .collect();
    let db = DB::open_cf_for_read_only(&opts, path, &families, false)?;

    let mut total = 0u64;
    for name in &families {
        let cf = db
            .cf_handle(name)
            .ok_or_else(|| IndexError::StoreUnavailable(format!("column family {} missing", name)))?;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            total += 1;
        }
    }
    Ok(total)
}

// ── Tests ──────────────────────────────────────────────────────────
