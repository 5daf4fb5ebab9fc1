//! Serialisable run statistics.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub binary_id: Option<String>,
    pub blocks: BlockCounters,
    pub cache: CacheCounters,
    pub signatures: SignatureCounters,
    pub top_blocks: Vec<TopBlock>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BlockCounters {
    /// Distinct guest addresses dispatched at least once.
    pub total_blocks: usize,
    /// Blocks at or above the hot-block execution threshold.
    pub hot_blocks: usize,
    pub total_executions: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheCounters {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SignatureCounters {
    pub total: usize,
    pub functions: usize,
    pub loops: usize,
    pub simd: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopBlock {
    /// Guest address, `0x`-hex.
    pub address: String,
    pub executions: u64,
}

impl RunStats {
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("run stats must serialize")
    }
}
