//! The Volans orchestrator.
//!
//! [`Machine`] wires the components together and drives the
//! translate→execute loop: discover the basic block at `rip`, look it up in
//! the two-level cache, translate on a miss (consulting the signature engine
//! for an optimised strategy), dispatch through the [`BlockExecutor`] seam,
//! count executions, checkpoint the cache periodically, and report hot
//! blocks at the end of a run.
//!
//! Ownership is a simple tree: the machine owns the cache, the persistence
//! manager, both arenas, the rule store and the signature engine. The cache
//! reaches persistence only through borrowed handles passed per call, so
//! there are no cycles.

#![forbid(unsafe_code)]

mod arena;
mod config;
mod cpu;
mod error;
mod stats;

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info, warn};

use volans_cache::{
    flags, unix_now_ns, BinaryId, CacheLevel, CacheStats, LookupOutcome, TranslationCache,
};
use volans_hash::xxh64;
use volans_persist::{PersistConfig, PersistStats, PersistenceManager};
use volans_rules::RuleStore;
use volans_sig::{identify_patterns, static_analyse, SignatureEngine, SignatureKind};
use volans_translate::{translate_block, translate_block_optimized, words_to_bytes};
use volans_x86::{analyse_block, BlockLimits};

pub use arena::{GuestArena, HostArena};
pub use config::{FeatureFlags, MachineConfig};
pub use cpu::{CpuState, PSTATE_Z, RFLAGS_ZF};
pub use error::{MachineError, Result};
pub use stats::{BlockCounters, CacheCounters, RunStats, SignatureCounters, TopBlock};

/// File name of the signature database inside the cache directory.
pub const SIGNATURE_DB_FILE: &str = "signatures.db";

/// Execution seam: jumping into translated host code is the embedder's
/// responsibility (executable mappings, fences, guest state hand-off).
pub trait BlockExecutor {
    fn execute(&mut self, host_addr: u64, host_code: &[u8], cpu: &mut CpuState);

    /// Guest address to continue from once `block` has run. The baseline
    /// advances straight through the block; a real integration derives this
    /// from the final guest state. Always makes progress.
    fn advance(&mut self, rip: u64, block: &DispatchedBlock) -> u64 {
        rip + u64::from(block.guest_len.max(1))
    }
}

/// Executor that runs nothing. Used when only translation and cache
/// behaviour matter (tests, offline cache warming).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExecutor;

impl BlockExecutor for NoopExecutor {
    fn execute(&mut self, _host_addr: u64, _host_code: &[u8], _cpu: &mut CpuState) {}
}

/// A block ready to dispatch: where it came from and where its host code
/// lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchedBlock {
    pub guest_addr: u64,
    pub guest_len: u32,
    pub host_addr: u64,
    pub host_len: u32,
    pub flags: u32,
    /// `None` when the block was translated on this dispatch.
    pub level: Option<CacheLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotBlock {
    pub guest_addr: u64,
    pub executions: u64,
}

/// What a [`Machine::run`] call did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub iterations: u64,
    /// Top blocks by execution count, candidates for re-optimisation.
    pub hot_blocks: Vec<HotBlock>,
}

#[derive(Debug)]
struct LoadedBinary {
    id: BinaryId,
    entry_point: u64,
    guest_len: usize,
    image_hash: u64,
}

pub struct Machine<E: BlockExecutor = NoopExecutor> {
    config: MachineConfig,
    rules: RuleStore,
    sig: SignatureEngine,
    cache: TranslationCache,
    persist: PersistenceManager,
    guest: GuestArena,
    host: HostArena,
    cpu: CpuState,
    executor: E,
    execution_counts: HashMap<u64, u64>,
    binary: Option<LoadedBinary>,
    iterations: u64,
}

impl Machine<NoopExecutor> {
    pub fn new(config: MachineConfig) -> Result<Self> {
        Self::with_executor(config, NoopExecutor)
    }
}

impl<E: BlockExecutor> Machine<E> {
    pub fn with_executor(config: MachineConfig, executor: E) -> Result<Self> {
        let rules = match &config.table_dir {
            Some(dir) => RuleStore::load_dir(dir)?,
            None => RuleStore::defaults(),
        };

        let mut persist_config = PersistConfig::new(&config.cache_dir);
        persist_config.max_cache_bytes = config.l2_max_bytes;
        let persist = PersistenceManager::new(persist_config)?;

        let mut sig = SignatureEngine::new();
        let db_path = persist.cache_dir().join(SIGNATURE_DB_FILE);
        if db_path.exists() {
            match sig.load(&db_path) {
                Ok(count) => debug!(count, "signature database loaded"),
                Err(error) => warn!(%error, "signature database rejected; starting empty"),
            }
        }

        Ok(Self {
            cache: TranslationCache::with_capacity(config.l1_entries),
            guest: GuestArena::new(config.guest_arena_bytes),
            host: HostArena::new(config.host_arena_bytes),
            cpu: CpuState::default(),
            executor,
            execution_counts: HashMap::new(),
            binary: None,
            iterations: 0,
            config,
            rules,
            sig,
            persist,
        })
    }

    /// Copy the guest program into the arena, derive its identity, seed the
    /// signature database from static analysis, and attach the on-disk
    /// cache (synchronously; this is the only blocking L2 read).
    pub fn load_binary(&mut self, bytes: &[u8], entry_point: u64) -> Result<BinaryId> {
        if bytes.len() > self.config.guest_arena_bytes {
            return Err(MachineError::InvalidInput(
                "guest program exceeds arena capacity",
            ));
        }

        self.guest.load(bytes, entry_point);
        let image_hash = xxh64(bytes, 0);

        // Reuse the identity of an existing cache file for the same content
        // hash so translations survive across runs; otherwise mint a fresh
        // one with the current timestamp.
        let id = find_cached_id(self.persist.cache_dir(), image_hash)
            .unwrap_or_else(|| BinaryId::new(image_hash, unix_now_ns()));
        info!(
            binary = %id,
            len = bytes.len(),
            entry_point = format_args!("{entry_point:#x}"),
            "guest binary loaded"
        );

        let signatures = static_analyse(bytes, entry_point);
        info!(count = signatures.len(), "static analysis produced signatures");
        self.sig.bulk_add(signatures);

        // Load-time pattern discovery over the image's basic blocks.
        let (block_bytes, block_addrs) =
            decompose_blocks(&self.rules, bytes, entry_point, self.config.max_block_bytes);
        let recurring = identify_patterns(&block_bytes, &block_addrs);
        if !recurring.is_empty() {
            debug!(count = recurring.len(), "recurring block patterns discovered");
        }
        self.sig.bulk_add(recurring);

        let had_image = self.cache.attach_binary(&self.persist, &id, image_hash);
        debug!(binary = %id, had_image, "persistent cache attached");

        self.cpu = CpuState::default();
        self.cpu.rip = entry_point;
        self.execution_counts.clear();
        self.iterations = 0;
        self.binary = Some(LoadedBinary {
            id: id.clone(),
            entry_point,
            guest_len: bytes.len(),
            image_hash,
        });
        Ok(id)
    }

    /// Run from the entry point until `rip` walks off the end of the image.
    ///
    /// Every dispatched block bumps its execution counter; the cache is
    /// checkpointed (with a flush barrier) every `checkpoint_interval`
    /// iterations and once more at the end, after which the hot blocks are
    /// selected and reported.
    pub fn run(&mut self) -> Result<RunSummary> {
        let (entry_point, guest_len) = {
            let binary = self.binary.as_ref().ok_or(MachineError::NoBinary)?;
            (binary.entry_point, binary.guest_len)
        };
        let end = entry_point + guest_len as u64;
        self.cpu.rip = entry_point;
        let start_iterations = self.iterations;

        while self.cpu.rip < end {
            let rip = self.cpu.rip;
            let block = self.find_or_translate(rip)?;

            let code = self
                .host
                .bytes_at(block.host_addr, block.host_len as usize)
                .unwrap_or(&[])
                .to_vec();
            self.cpu.sync_to_a64();
            self.executor.execute(block.host_addr, &code, &mut self.cpu);
            self.cpu.sync_to_x86();

            *self.execution_counts.entry(rip).or_insert(0) += 1;
            self.iterations += 1;

            if self.config.checkpoint_interval > 0
                && self.iterations % self.config.checkpoint_interval == 0
            {
                self.checkpoint();
            }

            self.cpu.rip = self.executor.advance(rip, &block);
        }

        let hot_blocks = self.select_hot_blocks();
        for hot in &hot_blocks {
            info!(
                guest_addr = format_args!("{:#x}", hot.guest_addr),
                executions = hot.executions,
                "hot block, candidate for optimised retranslation"
            );
        }

        self.checkpoint();
        self.persist.flush();

        Ok(RunSummary {
            iterations: self.iterations - start_iterations,
            hot_blocks,
        })
    }

    /// Resolve the block at `guest_addr`: block discovery, L1/L2 lookup,
    /// and on a miss translation plus placement into the host arena.
    pub fn find_or_translate(&mut self, guest_addr: u64) -> Result<DispatchedBlock> {
        let binary = self.binary.as_ref().ok_or(MachineError::NoBinary)?;

        let window = self
            .guest
            .window(guest_addr, self.config.max_block_bytes)
            .ok_or(MachineError::InvalidInput("guest address outside the image"))?;
        let block_len = analyse_block(
            &self.rules,
            window,
            BlockLimits {
                max_bytes: self.config.max_block_bytes,
            },
        );
        let block = &window[..block_len];

        match self.cache.lookup(&self.persist, &binary.id, guest_addr, block) {
            LookupOutcome::L1(entry) => Ok(DispatchedBlock {
                guest_addr: entry.guest_addr,
                guest_len: entry.guest_len,
                host_addr: entry.host_addr,
                host_len: entry.host_len,
                flags: entry.flags,
                level: Some(CacheLevel::L1),
            }),
            LookupOutcome::L2 {
                mut entry,
                host_bytes,
            } => {
                let host_addr =
                    self.host
                        .alloc(&host_bytes)
                        .ok_or(MachineError::CapacityExhausted {
                            needed: host_bytes.len(),
                            available: self.host.available(),
                        })?;
                entry.host_addr = host_addr;
                self.cache.promote(&binary.id, entry.clone());
                debug!(
                    guest_addr = format_args!("{guest_addr:#x}"),
                    host_addr, "block restored from persistent cache"
                );
                Ok(DispatchedBlock {
                    guest_addr: entry.guest_addr,
                    guest_len: entry.guest_len,
                    host_addr,
                    host_len: entry.host_len,
                    flags: entry.flags,
                    level: Some(CacheLevel::L2),
                })
            }
            LookupOutcome::Miss => {
                let matched_kind = if self.config.optimization_level > 0 {
                    self.sig.find_match(block).map(|sig| sig.kind)
                } else {
                    None
                };
                let optimized = matches!(
                    matched_kind,
                    Some(SignatureKind::Function | SignatureKind::Loop)
                );

                let words = if optimized {
                    debug!(
                        guest_addr = format_args!("{guest_addr:#x}"),
                        kind = ?matched_kind,
                        "signature match, optimised translation"
                    );
                    translate_block_optimized(&self.rules, block)
                } else {
                    translate_block(&self.rules, block)
                };
                let host_bytes = words_to_bytes(&words);

                let host_addr =
                    self.host
                        .alloc(&host_bytes)
                        .ok_or(MachineError::CapacityExhausted {
                            needed: host_bytes.len(),
                            available: self.host.available(),
                        })?;

                let mut entry_flags = 0;
                if optimized {
                    entry_flags |= flags::OPTIMIZED | flags::FROM_SIGNATURE;
                }
                if self.config.features.pac {
                    entry_flags |= flags::PAC;
                }
                if self.config.features.bti {
                    entry_flags |= flags::BTI;
                }
                if self.config.features.mte {
                    entry_flags |= flags::MTE;
                }

                let entry = self.cache.store(
                    &binary.id,
                    guest_addr,
                    block,
                    host_addr,
                    &host_bytes,
                    entry_flags,
                );
                Ok(DispatchedBlock {
                    guest_addr,
                    guest_len: entry.guest_len,
                    host_addr,
                    host_len: entry.host_len,
                    flags: entry_flags,
                    level: None,
                })
            }
        }
    }

    /// Marshal the loaded binary's live translations into its cache file and
    /// wait for the write to become durable.
    pub fn checkpoint(&self) {
        let Some(binary) = &self.binary else {
            return;
        };
        let host = &self.host;
        self.cache
            .checkpoint(&self.persist, &binary.id, binary.image_hash, |entry| {
                host.bytes_at(entry.host_addr, entry.host_len as usize)
                    .map(<[u8]>::to_vec)
            });
        self.persist.flush();
    }

    fn select_hot_blocks(&self) -> Vec<HotBlock> {
        let mut blocks: Vec<HotBlock> = self
            .execution_counts
            .iter()
            .filter(|&(_, &count)| count >= self.config.hot_block_min_count)
            .map(|(&guest_addr, &executions)| HotBlock {
                guest_addr,
                executions,
            })
            .collect();
        blocks.sort_by(|a, b| {
            b.executions
                .cmp(&a.executions)
                .then(a.guest_addr.cmp(&b.guest_addr))
        });
        blocks.truncate(self.config.hot_block_limit);
        blocks
    }

    /// Mutate loaded guest bytes in place (guest code writing to itself).
    pub fn poke_guest(&mut self, guest_addr: u64, bytes: &[u8]) -> Result<()> {
        if self.guest.write(guest_addr, bytes) {
            Ok(())
        } else {
            Err(MachineError::InvalidInput("write outside the guest image"))
        }
    }

    /// Persist the signature database into the cache directory.
    pub fn save_signatures(&self) -> Result<()> {
        let path = self.persist.cache_dir().join(SIGNATURE_DB_FILE);
        self.sig
            .save(&path)
            .map_err(|err| MachineError::Config(format!("signature database: {err}")))
    }

    /// Flush, then delete every on-disk cache file.
    pub fn clear_disk_cache(&self) -> Result<()> {
        self.persist.clear_cache()?;
        Ok(())
    }

    pub fn stats(&self) -> RunStats {
        let cache = self.cache.stats();
        let hits = cache.l1_hits + cache.l2_hits;
        let lookups = hits + cache.misses;

        let kind_counts = self.sig.kind_counts();
        let total_executions: u64 = self.execution_counts.values().sum();
        let hot = self
            .execution_counts
            .values()
            .filter(|&&count| count >= self.config.hot_block_min_count)
            .count();

        RunStats {
            binary_id: self.binary.as_ref().map(|b| b.id.to_string()),
            blocks: BlockCounters {
                total_blocks: self.execution_counts.len(),
                hot_blocks: hot,
                total_executions,
            },
            cache: CacheCounters {
                l1_hits: cache.l1_hits,
                l2_hits: cache.l2_hits,
                misses: cache.misses,
                entries: self.cache.len(),
                hit_rate: if lookups > 0 {
                    hits as f64 / lookups as f64
                } else {
                    0.0
                },
            },
            signatures: SignatureCounters {
                total: self.sig.len(),
                functions: kind_counts
                    .get(&SignatureKind::Function)
                    .copied()
                    .unwrap_or(0),
                loops: kind_counts.get(&SignatureKind::Loop).copied().unwrap_or(0),
                simd: kind_counts.get(&SignatureKind::Simd).copied().unwrap_or(0),
            },
            top_blocks: self
                .select_hot_blocks()
                .into_iter()
                .map(|hot| TopBlock {
                    address: format!("{:#x}", hot.guest_addr),
                    executions: hot.executions,
                })
                .collect(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn persist_stats(&self) -> PersistStats {
        self.persist.stats()
    }

    pub fn signature_count(&self) -> usize {
        self.sig.len()
    }

    /// Host code of a dispatched block, as stored in the arena.
    pub fn host_code(&self, block: &DispatchedBlock) -> Option<&[u8]> {
        self.host.bytes_at(block.host_addr, block.host_len as usize)
    }

    pub fn execution_count(&self, guest_addr: u64) -> u64 {
        self.execution_counts.get(&guest_addr).copied().unwrap_or(0)
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn binary_id(&self) -> Option<&BinaryId> {
        self.binary.as_ref().map(|b| &b.id)
    }
}

/// Split an image into consecutive basic blocks for pattern discovery.
fn decompose_blocks(
    rules: &RuleStore,
    image: &[u8],
    base: u64,
    max_block_bytes: usize,
) -> (Vec<Vec<u8>>, Vec<u64>) {
    let mut blocks = Vec::new();
    let mut addresses = Vec::new();
    let mut offset = 0;

    while offset < image.len() {
        let len = analyse_block(
            rules,
            &image[offset..],
            BlockLimits {
                max_bytes: max_block_bytes,
            },
        );
        if len == 0 {
            // Truncated tail instruction; nothing more to delimit.
            break;
        }
        blocks.push(image[offset..offset + len].to_vec());
        addresses.push(base + offset as u64);
        offset += len;
    }

    (blocks, addresses)
}

/// Newest cache-file identity in `dir` whose content hash matches.
fn find_cached_id(dir: &Path, image_hash: u64) -> Option<BinaryId> {
    let mut best: Option<BinaryId> = None;
    for entry in std::fs::read_dir(dir).ok()? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "cache") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(id) = BinaryId::parse(stem) else {
            continue;
        };
        if id.content_hash() != image_hash {
            continue;
        }
        if best
            .as_ref()
            .is_none_or(|current| id.created_ns() > current.created_ns())
        {
            best = Some(id);
        }
    }
    best
}
