//! In-memory translation entries.

/// Access count above which an entry is considered hot. Hot entries resist
/// eviction until no cold entry is left.
pub const HOT_ACCESS_THRESHOLD: u32 = 10;

/// Feature flags recorded on a translation entry. Pass-through metadata: the
/// core attaches them but assigns no semantics.
pub mod flags {
    /// Translated through the optimised (peephole) path.
    pub const OPTIMIZED: u32 = 1 << 0;
    /// A signature match selected the translation strategy.
    pub const FROM_SIGNATURE: u32 = 1 << 1;
    /// Pointer authentication requested for this block.
    pub const PAC: u32 = 1 << 2;
    /// Branch target identification requested for this block.
    pub const BTI: u32 = 1 << 3;
    /// Memory tagging requested for this block.
    pub const MTE: u32 = 1 << 4;
}

/// One translated basic block.
///
/// `(guest_addr, guest_hash)` identifies the entry; a lookup that matches
/// the address but not the hash is a miss, which is what makes cached
/// translations safe against guest code mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationEntry {
    pub guest_addr: u64,
    /// Host arena offset of the translated code.
    pub host_addr: u64,
    pub guest_len: u32,
    pub host_len: u32,
    /// Fingerprint of the exact guest bytes at translation time.
    pub guest_hash: u64,
    pub last_access_ns: u64,
    pub access_count: u32,
    pub hot: bool,
    pub flags: u32,
}

impl TranslationEntry {
    /// Record a hit: bump the access count, refresh the timestamp, and
    /// recompute hotness. Hotness never clears here; an entry stops being
    /// hot only by leaving the cache.
    pub fn touch(&mut self, now_ns: u64) {
        self.last_access_ns = now_ns;
        self.access_count = self.access_count.saturating_add(1);
        if self.access_count > HOT_ACCESS_THRESHOLD {
            self.hot = true;
        }
    }
}
