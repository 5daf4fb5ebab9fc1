//! Basic-block translation.
//!
//! Translation is strictly local: each guest instruction maps to the host
//! words of its translation rule, with no cross-instruction optimisation or
//! register renaming at this layer. That keeps the output a pure function of
//! the guest bytes and the rule store, which the on-disk cache depends on:
//! a block translated today must byte-match a block translated last week.
//!
//! The optimised path ([`translate_block_optimized`]) additionally applies
//! peephole patterns over multi-instruction shapes. It is selected by the
//! orchestrator when the signature engine recognises a function or loop; it
//! is equally deterministic.

#![forbid(unsafe_code)]

use tracing::debug;
use volans_rules::RuleStore;
use volans_x86::{decode, DecodedInst};

/// AArch64 `NOP`, emitted for guest instructions without a translation rule
/// and for zero-length blocks.
pub const HOST_NOP: u32 = 0xD503201F;

/// Translate one basic block of guest bytes into host instruction words.
///
/// Unknown opcodes translate to a single [`HOST_NOP`]; the skip is traced so
/// coverage gaps show up in the logs. A zero-length block yields a single
/// NOP so every translation has an executable host body.
pub fn translate_block(rules: &RuleStore, guest: &[u8]) -> Vec<u32> {
    let mut host = Vec::new();
    let mut offset = 0;

    while offset < guest.len() {
        let inst = decode(rules, guest, offset);
        if inst.is_truncated() {
            break;
        }
        emit_instruction(rules, &inst, &mut host);
        offset += inst.length;
    }

    if host.is_empty() {
        host.push(HOST_NOP);
    }
    host
}

/// Translate with peephole patterns applied first.
///
/// At each offset the first matching pattern wins and consumes its full
/// guest byte span; otherwise the head instruction is translated through the
/// regular rule table and the walk continues behind it.
pub fn translate_block_optimized(rules: &RuleStore, guest: &[u8]) -> Vec<u32> {
    let mut host = Vec::new();
    let mut offset = 0;

    'outer: while offset < guest.len() {
        for pattern in rules.peepholes() {
            if pattern.matches(&guest[offset..]) {
                debug!(
                    pattern = %pattern.id,
                    offset,
                    "peephole pattern applied"
                );
                host.extend_from_slice(&pattern.host_words);
                offset += pattern.guest_len();
                continue 'outer;
            }
        }

        let inst = decode(rules, guest, offset);
        if inst.is_truncated() {
            break;
        }
        emit_instruction(rules, &inst, &mut host);
        offset += inst.length;
    }

    if host.is_empty() {
        host.push(HOST_NOP);
    }
    host
}

fn emit_instruction(rules: &RuleStore, inst: &DecodedInst, host: &mut Vec<u32>) {
    match rules.translation(inst.opcode) {
        Some(rule) => host.extend_from_slice(&rule.host_words),
        None => {
            debug!(
                opcode = format_args!("{:#04x}", inst.opcode),
                "no translation rule, emitting nop"
            );
            host.push(HOST_NOP);
        }
    }
}

/// Serialise host words to the little-endian byte layout used by the host
/// arena and the on-disk cache blob.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Inverse of [`words_to_bytes`]; trailing partial words are dropped.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("4-byte chunk")))
        .collect()
}
