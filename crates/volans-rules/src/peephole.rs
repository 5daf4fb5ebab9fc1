//! Peephole patterns: multi-instruction guest byte sequences with a canned
//! host translation.
//!
//! Patterns may contain `XX` wildcard bytes for relocatable immediates (a
//! call displacement differs at every site but the surrounding shape is
//! identical). The optimised translation path tries these before falling
//! back to single-instruction rules.

use crate::error::{Result, RuleError};
use crate::parse::{described_lines, parse_hex_u8, parse_hex_u32};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternByte {
    Exact(u8),
    /// `XX` in the table: matches any byte.
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeepholePattern {
    pub id: String,
    pub guest: Vec<PatternByte>,
    pub host_words: Vec<u32>,
    pub description: String,
}

impl PeepholePattern {
    /// Number of guest bytes the pattern consumes.
    pub fn guest_len(&self) -> usize {
        self.guest.len()
    }

    /// Whether the pattern matches a prefix of `bytes`.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() >= self.guest.len()
            && self
                .guest
                .iter()
                .zip(bytes)
                .all(|(pat, &byte)| match pat {
                    PatternByte::Exact(expected) => *expected == byte,
                    PatternByte::Any => true,
                })
    }
}

/// Format: `ID x86_bytes ARM_words # description`.
///
/// Guest bytes are two hex digits or `XX`; host words are longer hex tokens
/// (with or without `0x`). The first token wider than two characters ends the
/// guest byte run.
pub(crate) fn parse_table(file: &str, text: &str) -> Result<Vec<PeepholePattern>> {
    let mut out = Vec::new();
    for (line, fields, desc) in described_lines(text) {
        let mut tokens = fields.split_whitespace();
        let id = tokens.next().expect("described_lines yields non-empty fields");

        let mut guest = Vec::new();
        let mut host_words = Vec::new();
        let mut in_words = false;
        for token in tokens {
            if !in_words && token.len() <= 2 {
                if token.eq_ignore_ascii_case("XX") {
                    guest.push(PatternByte::Any);
                } else {
                    let byte = parse_hex_u8(token).ok_or_else(|| {
                        RuleError::parse(file, line, format!("bad guest byte {token:?}"))
                    })?;
                    guest.push(PatternByte::Exact(byte));
                }
            } else {
                in_words = true;
                let word = parse_hex_u32(token).ok_or_else(|| {
                    RuleError::parse(file, line, format!("bad host word {token:?}"))
                })?;
                host_words.push(word);
            }
        }

        if guest.is_empty() || host_words.is_empty() {
            return Err(RuleError::parse(
                file,
                line,
                "pattern needs guest bytes and host words",
            ));
        }

        out.push(PeepholePattern {
            id: id.to_string(),
            guest,
            host_words,
            description: desc.to_string(),
        });
    }
    Ok(out)
}

pub(crate) fn default_table() -> Vec<PeepholePattern> {
    fn pattern(id: &str, guest: &[i16], host_words: &[u32], description: &str) -> PeepholePattern {
        // -1 encodes a wildcard in the shorthand below.
        PeepholePattern {
            id: id.to_string(),
            guest: guest
                .iter()
                .map(|&b| {
                    if b < 0 {
                        PatternByte::Any
                    } else {
                        PatternByte::Exact(b as u8)
                    }
                })
                .collect(),
            host_words: host_words.to_vec(),
            description: description.to_string(),
        }
    }

    vec![
        pattern(
            "PROLOGUE",
            &[0x55, 0x48, 0x89, 0xE5],
            &[0xA9BF7BFD, 0x910003FD],
            "push rbp; mov rbp, rsp -> stp x29, x30, [sp, -16]!; mov x29, sp",
        ),
        pattern(
            "EPILOGUE",
            &[0x5D, 0xC3],
            &[0xA8C17BFD, 0xD65F03C0],
            "pop rbp; ret -> ldp x29, x30, [sp], 16; ret",
        ),
        pattern(
            "CALL_REL32",
            &[0xE8, -1, -1, -1, -1],
            &[0xF81F0FE0, 0x94000000],
            "near call with relocatable rel32 -> str x0, [sp, -16]!; bl",
        ),
        pattern(
            "XOR_SELF",
            &[0x31, 0xC0],
            &[0xAA1F03E0],
            "xor eax, eax -> mov x0, xzr",
        ),
    ]
}

pub(crate) fn render_table(patterns: &[PeepholePattern]) -> String {
    let mut out =
        String::from("# Peephole patterns\n# ID x86_bytes ARM_words # description (XX = wildcard byte)\n");
    for p in patterns {
        out.push_str(&p.id);
        for byte in &p.guest {
            match byte {
                PatternByte::Exact(b) => out.push_str(&format!(" {b:02X}")),
                PatternByte::Any => out.push_str(" XX"),
            }
        }
        for word in &p.host_words {
            out.push_str(&format!(" 0x{word:08X}"));
        }
        out.push_str(&format!(" # {}\n", p.description));
    }
    out
}
