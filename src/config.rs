//! Benchmark run configuration.
//!
//! Loaded from JSON. Example:
//!
//! ```json
//! {
//!   "dataset": { "format": "laghos-dir", "dir": "data/1m_mesh" },
//!   "batch_size": 65536,
//!   "output_dir": "/tmp/meshidx",
//!   "trials": [
//!     { "description": "BKD 3 of 9 dims", "index": { "kind": "spatial", "num_index_dims": 3 } },
//!     { "description": "RocksDB multi", "index": { "kind": "key-value", "fanout": 8 } }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cursor::DEFAULT_BATCH_SIZE;
use crate::error::{IndexError, Result};
use crate::kv::KvConfig;
use crate::source::{LaghosFiles, MemorySource, MeshSource, PointFileSource};
use crate::spatial::SpatialConfig;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_points_per_element() -> u32 {
    8
}

// ── DatasetConfig ───────────────────────────────────────────────────

/// Where the points come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "kebab-case")]
pub enum DatasetConfig {
    /// Explicit Laghos mesh and grid function files.
    Laghos {
        mesh: PathBuf,
        e: PathBuf,
        rho: PathBuf,
        v: PathBuf,
    },
    /// Directory holding `mesh`, `e`, `rho` and `v`.
    LaghosDir { dir: PathBuf },
    /// Flat point file written by `export`.
    PointFile { path: PathBuf },
    /// Generated lattice, for runs without mesh data.
    Synthetic {
        elements: u64,
        #[serde(default = "default_points_per_element")]
        points_per_element: u32,
    },
}

impl DatasetConfig {
    /// Open the configured source.
    pub fn open(&self) -> Result<Box<dyn MeshSource>> {
        match self {
            DatasetConfig::Laghos { mesh, e, rho, v } => open_laghos(&LaghosFiles {
                mesh: mesh.clone(),
                e: e.clone(),
                rho: rho.clone(),
                v: v.clone(),
            }),
            DatasetConfig::LaghosDir { dir } => open_laghos(&LaghosFiles::in_dir(dir)),
            DatasetConfig::PointFile { path } => Ok(Box::new(PointFileSource::open(path)?)),
            DatasetConfig::Synthetic {
                elements,
                points_per_element,
            } => Ok(Box::new(MemorySource::synthetic(*elements, *points_per_element))),
        }
    }

    /// Short human-readable label.
    pub fn describe(&self) -> String {
        match self {
            DatasetConfig::Laghos { mesh, .. } => format!("laghos {}", mesh.display()),
            DatasetConfig::LaghosDir { dir } => format!("laghos {}", dir.display()),
            DatasetConfig::PointFile { path } => format!("points {}", path.display()),
            DatasetConfig::Synthetic {
                elements,
                points_per_element,
            } => format!("synthetic {}x{}", elements, points_per_element),
        }
    }
}

#[cfg(feature = "mfem")]
fn open_laghos(files: &LaghosFiles) -> Result<Box<dyn MeshSource>> {
    Ok(Box::new(crate::source::LaghosSource::open(files)?))
}

#[cfg(not(feature = "mfem"))]
fn open_laghos(files: &LaghosFiles) -> Result<Box<dyn MeshSource>> {
    files.check_exist()?;
    Err(IndexError::SourceOpen {
        path: files.mesh.clone(),
        reason: "built without the `mfem` feature; export to a point file first".to_string(),
    })
}

// ── Trials ──────────────────────────────────────────────────────────

/// Which index a trial builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum IndexKind {
    Spatial(SpatialConfig),
    KeyValue(KvConfig),
}

impl IndexKind {
    pub fn validate(&self) -> Result<()> {
        match self {
            IndexKind::Spatial(c) => c.validate(),
            IndexKind::KeyValue(c) => c.validate(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            IndexKind::Spatial(_) => "spatial",
            IndexKind::KeyValue(_) => "key-value",
        }
    }
}

/// One timed index build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialConfig {
    /// Printed in front of the elapsed time.
    pub description: String,
    pub index: IndexKind,
}

// ── BenchConfig ─────────────────────────────────────────────────────

/// A full benchmark run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchConfig {
    pub dataset: DatasetConfig,
    /// Records per cursor batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Parent directory for index artifacts, one subdirectory per trial.
    pub output_dir: PathBuf,
    pub trials: Vec<TrialConfig>,
    /// Leave artifacts on disk after measuring.
    #[serde(default)]
    pub keep_artifacts: bool,
}

impl BenchConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: BenchConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IndexError::InvalidConfig("batch_size must be positive".to_string()));
        }
        if self.trials.is_empty() {
            return Err(IndexError::InvalidConfig("no trials configured".to_string()));
        }
        for trial in &self.trials {
            trial.index.validate().map_err(|e| {
                IndexError::InvalidConfig(format!("trial '{}': {}", trial.description, e))
            })?;
        }
        Ok(())
    }

    /// Artifact directory for the trial at `position`.
    pub fn trial_dir(&self, position: usize) -> PathBuf {
        let trial = &self.trials[position];
        self.output_dir
            .join(format!("trial-{:02}-{}", position, trial.index.label()))
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "dataset": { "format": "synthetic", "elements": 128 },
        "output_dir": "/tmp/meshidx-test",
        "trials": [
            { "description": "bkd", "index": { "kind": "spatial", "num_index_dims": 2 } },
            { "description": "rocks multi", "index": { "kind": "key-value", "fanout": 8 } }
        ]
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let config: BenchConfig = serde_json::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(
            config.dataset,
            DatasetConfig::Synthetic {
                elements: 128,
                points_per_element: 8
            }
        );
        match &config.trials[0].index {
            IndexKind::Spatial(c) => {
                assert_eq!(c.num_index_dims, 2);
                assert_eq!(c.num_dims, 9);
                assert_eq!(c.max_points_in_leaf, 512);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        match &config.trials[1].index {
            IndexKind::KeyValue(c) => assert_eq!(c.fanout, 8),
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(config.trial_dir(1).ends_with("trial-01-key-value"));
    }

    #[test]
    fn test_invalid_fanout_rejected() {
        let text = SAMPLE.replace("\"fanout\": 8", "\"fanout\": 12");
        let config: BenchConfig = serde_json::from_str(&text).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rocks multi"));
    }

    #[test]
    fn test_laghos_dir_missing_files() {
        let dataset = DatasetConfig::LaghosDir {
            dir: PathBuf::from("/nonexistent/mesh"),
        };
        let err = dataset.open().err().unwrap();
        assert!(matches!(err, IndexError::SourceOpen { .. }));
    }

    #[test]
    fn test_synthetic_opens() {
        let dataset = DatasetConfig::Synthetic {
            elements: 4,
            points_per_element: 8,
        };
        let source = dataset.open().unwrap();
        assert_eq!(source.num_points(), Some(32));
    }
}
