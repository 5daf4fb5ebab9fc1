//! JSON configuration.
//!
//! Every field has a default matching the hardwired thresholds elsewhere in
//! the workspace, so a partial document (or none at all) is always valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MachineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Directory holding the per-binary cache files and the signature
    /// database.
    pub cache_dir: PathBuf,
    /// L1 translation cache capacity, in entries.
    pub l1_entries: usize,
    /// Hard cap for the on-disk cache sweep, in bytes.
    pub l2_max_bytes: u64,
    /// Coarse optimisation level; 0 disables the signature-selected
    /// optimised translation path.
    pub optimization_level: u8,
    pub features: FeatureFlags,
    pub guest_arena_bytes: usize,
    pub host_arena_bytes: usize,
    /// Maximum basic-block length in guest bytes.
    pub max_block_bytes: usize,
    /// Checkpoint the cache every N dispatched blocks.
    pub checkpoint_interval: u64,
    /// How many hot blocks the run summary reports.
    pub hot_block_limit: usize,
    /// Minimum execution count for a block to count as hot.
    pub hot_block_min_count: u64,
    /// Directory of the rule tables; `None` uses the built-in defaults
    /// without touching disk.
    pub table_dir: Option<PathBuf>,
}

/// Pass-through hardening toggles. Recorded on translation entries; the
/// core assigns no semantics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub pac: bool,
    pub bti: bool,
    pub mte: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            l1_entries: 1024,
            l2_max_bytes: 1024 * 1024 * 1024,
            optimization_level: 1,
            features: FeatureFlags::default(),
            guest_arena_bytes: 1024 * 1024,
            host_arena_bytes: 1024 * 1024,
            max_block_bytes: 1024,
            checkpoint_interval: 100,
            hot_block_limit: 10,
            hot_block_min_count: 10,
            table_dir: None,
        }
    }
}

impl MachineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| MachineError::Config(err.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            MachineError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&text)
    }
}
