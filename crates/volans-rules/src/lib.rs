//! Static translation tables for Volans.
//!
//! The decoder, translator and optimiser are all table-driven. This crate
//! owns the in-memory tables and the whitespace-delimited text formats they
//! are loaded from:
//!
//! - x86 decode table ([`X86_TABLE_FILE`]): per-opcode field hints
//! - AArch64 encoding table ([`A64_TABLE_FILE`]): advisory, diagnostics only
//! - translation rules ([`TRANSLATION_TABLE_FILE`]): opcode → host words
//! - register map ([`REGISTER_MAP_FILE`]): guest↔host register assignment
//! - peephole patterns ([`PEEPHOLE_TABLE_FILE`]): multi-byte guest shapes
//!
//! A missing file seeds a hardcoded bootstrap table and writes it back to
//! disk, so a bare directory is a valid starting state. The write-back is
//! idempotent. A present-but-malformed file fails the load with a
//! line-numbered [`RuleError`].

#![forbid(unsafe_code)]

mod a64;
mod error;
mod parse;
mod peephole;
mod regmap;
mod x86;
mod xlat;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub use a64::A64Encoding;
pub use error::{Result, RuleError};
pub use peephole::{PatternByte, PeepholePattern};
pub use regmap::RegMapping;
pub use x86::X86Insn;
pub use xlat::TranslationRule;

pub const X86_TABLE_FILE: &str = "x86_defs.txt";
pub const A64_TABLE_FILE: &str = "arm_defs.txt";
pub const TRANSLATION_TABLE_FILE: &str = "translation_rules.txt";
pub const REGISTER_MAP_FILE: &str = "register_map.txt";
pub const PEEPHOLE_TABLE_FILE: &str = "peephole_patterns.txt";

/// All loaded tables, queried independently.
///
/// Opcode lookups are O(1). Duplicate opcodes are permitted in the input;
/// the first loaded entry is authoritative.
#[derive(Debug, Clone)]
pub struct RuleStore {
    x86: HashMap<u8, X86Insn>,
    a64: HashMap<u32, A64Encoding>,
    rules: Vec<TranslationRule>,
    rule_index: HashMap<u8, usize>,
    regmap: Vec<RegMapping>,
    peepholes: Vec<PeepholePattern>,
}

impl RuleStore {
    /// Store seeded with the hardcoded bootstrap tables
    /// (NOP/MOV/ADD/SUB/CALL/RET and the SIMD prefix).
    pub fn defaults() -> Self {
        Self::from_tables(
            x86::default_table(),
            a64::default_table(),
            xlat::default_table(),
            regmap::default_table(),
            peephole::default_table(),
        )
    }

    fn from_tables(
        x86_table: Vec<X86Insn>,
        a64_table: Vec<A64Encoding>,
        rules: Vec<TranslationRule>,
        regmap: Vec<RegMapping>,
        peepholes: Vec<PeepholePattern>,
    ) -> Self {
        let mut x86 = HashMap::new();
        for insn in x86_table {
            x86.entry(insn.opcode).or_insert(insn);
        }
        let mut a64 = HashMap::new();
        for enc in a64_table {
            a64.entry(enc.opcode).or_insert(enc);
        }
        let mut rule_index = HashMap::new();
        for (idx, rule) in rules.iter().enumerate() {
            rule_index.entry(rule.x86_opcode).or_insert(idx);
        }
        Self {
            x86,
            a64,
            rules,
            rule_index,
            regmap,
            peepholes,
        }
    }

    /// Load all tables from `dir`.
    ///
    /// Each absent table falls back to its bootstrap default, which is then
    /// written to `dir` so the next run sees a complete set. Failing to
    /// write a default is fatal: the caller has neither configuration nor a
    /// way to create it.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let x86_table = load_or_seed(dir, X86_TABLE_FILE, x86::parse_table, || {
            x86::render_table(&x86::default_table())
        })?;
        let a64_table = load_or_seed(dir, A64_TABLE_FILE, a64::parse_table, || {
            a64::render_table(&a64::default_table())
        })?;
        let rules = load_or_seed(dir, TRANSLATION_TABLE_FILE, xlat::parse_table, || {
            xlat::render_table(&xlat::default_table())
        })?;
        let regmap = load_or_seed(dir, REGISTER_MAP_FILE, regmap::parse_table, || {
            regmap::render_table(&regmap::default_table())
        })?;
        let peepholes = load_or_seed(dir, PEEPHOLE_TABLE_FILE, peephole::parse_table, || {
            peephole::render_table(&peephole::default_table())
        })?;

        Ok(Self::from_tables(x86_table, a64_table, rules, regmap, peepholes))
    }

    /// Write the bootstrap tables to `dir`, overwriting existing files.
    /// Writing twice produces byte-identical files.
    pub fn write_defaults(dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(X86_TABLE_FILE), x86::render_table(&x86::default_table()))?;
        fs::write(dir.join(A64_TABLE_FILE), a64::render_table(&a64::default_table()))?;
        fs::write(
            dir.join(TRANSLATION_TABLE_FILE),
            xlat::render_table(&xlat::default_table()),
        )?;
        fs::write(
            dir.join(REGISTER_MAP_FILE),
            regmap::render_table(&regmap::default_table()),
        )?;
        fs::write(
            dir.join(PEEPHOLE_TABLE_FILE),
            peephole::render_table(&peephole::default_table()),
        )?;
        Ok(())
    }

    pub fn x86_insn(&self, opcode: u8) -> Option<&X86Insn> {
        self.x86.get(&opcode)
    }

    pub fn a64_encoding(&self, word: u32) -> Option<&A64Encoding> {
        self.a64.get(&word)
    }

    /// First-loaded translation rule for `opcode`, if any.
    pub fn translation(&self, opcode: u8) -> Option<&TranslationRule> {
        self.rule_index.get(&opcode).map(|&idx| &self.rules[idx])
    }

    pub fn translation_rules(&self) -> &[TranslationRule] {
        &self.rules
    }

    pub fn register_mappings(&self) -> &[RegMapping] {
        &self.regmap
    }

    pub fn register_mapping(&self, x86_name: &str) -> Option<&RegMapping> {
        self.regmap.iter().find(|m| m.x86 == x86_name)
    }

    pub fn peepholes(&self) -> &[PeepholePattern] {
        &self.peepholes
    }
}

fn load_or_seed<T>(
    dir: &Path,
    file: &str,
    parse: impl Fn(&str, &str) -> Result<T>,
    default_text: impl Fn() -> String,
) -> Result<T> {
    let path = dir.join(file);
    match fs::read_to_string(&path) {
        Ok(text) => parse(file, &text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let text = default_text();
            fs::write(&path, &text)?;
            parse(file, &text)
        }
        Err(err) => Err(err.into()),
    }
}
