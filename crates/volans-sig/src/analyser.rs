//! Static analysis of a guest binary at load time.
//!
//! Two cheap byte-pattern scans seed the signature database before any
//! block is translated:
//!
//! - function candidates: `55 48 89 E5` (`push rbp; mov rbp, rsp`) up to the
//!   first `C3` within [`MAX_FUNCTION_LEN`] bytes
//! - loop candidates: `FF C8` (`dec eax`) followed by `75` with a negative
//!   8-bit offset, spanning back to the jump target
//!
//! Both kinds get a relocation mask zeroing the displacement bytes after
//! short conditional jumps (`70..=7F`, one byte) and near call/jump
//! (`E8`/`E9`, four bytes), so a copy of the same code at a different
//! address still matches.

use tracing::debug;

use crate::{Signature, SignatureEngine, SignatureKind};

/// Function candidates longer than this are discarded as false positives.
const MAX_FUNCTION_LEN: usize = 10_000;

const FUNCTION_THRESHOLD: f32 = 0.85;
const LOOP_THRESHOLD: f32 = 0.9;

/// Scan `binary` (loaded at `base_address`) and produce signatures for every
/// function and loop candidate found.
pub fn static_analyse(binary: &[u8], base_address: u64) -> Vec<Signature> {
    let mut signatures = Vec::new();

    for (offset, len) in find_functions(binary) {
        let code = &binary[offset..offset + len];
        signatures.push(SignatureEngine::create_signature(
            code,
            SignatureKind::Function,
            base_address + offset as u64,
            relocation_mask(code),
            FUNCTION_THRESHOLD,
        ));
    }

    for (offset, len) in find_loops(binary) {
        let code = &binary[offset..offset + len];
        signatures.push(SignatureEngine::create_signature(
            code,
            SignatureKind::Loop,
            base_address + offset as u64,
            relocation_mask(code),
            LOOP_THRESHOLD,
        ));
    }

    debug!(count = signatures.len(), "static analysis complete");
    signatures
}

/// `(offset, length)` of every prologue-to-ret span.
fn find_functions(binary: &[u8]) -> Vec<(usize, usize)> {
    const PROLOGUE: [u8; 4] = [0x55, 0x48, 0x89, 0xE5];

    let mut functions = Vec::new();
    let mut i = 0;
    while i + PROLOGUE.len() <= binary.len() {
        if binary[i..i + PROLOGUE.len()] != PROLOGUE {
            i += 1;
            continue;
        }

        let search_end = binary.len().min(i + MAX_FUNCTION_LEN);
        match binary[i + PROLOGUE.len()..search_end]
            .iter()
            .position(|&b| b == 0xC3)
        {
            Some(ret) => {
                let len = PROLOGUE.len() + ret + 1;
                functions.push((i, len));
                i += PROLOGUE.len();
            }
            None => i += 1,
        }
    }
    functions
}

/// `(offset, length)` of every backward `dec eax; jnz` span.
fn find_loops(binary: &[u8]) -> Vec<(usize, usize)> {
    let mut loops = Vec::new();
    for i in 0..binary.len().saturating_sub(3) {
        if binary[i] != 0xFF || binary[i + 1] != 0xC8 || binary[i + 2] != 0x75 {
            continue;
        }
        let offset = binary[i + 3] as i8;
        if offset >= 0 {
            // A forward jump is not a loop back-edge.
            continue;
        }

        let distance = usize::from(offset.unsigned_abs());
        // The jump target is relative to the end of the JNZ (i + 4); the
        // loop body runs from there through the JNZ itself.
        let Some(start) = (i + 4).checked_sub(distance + 4) else {
            continue;
        };
        loops.push((start, distance + 4));
    }
    loops
}

/// All-ones mask with the displacement bytes of relocatable control
/// transfers zeroed.
pub(crate) fn relocation_mask(code: &[u8]) -> Vec<u8> {
    let mut mask = vec![1u8; code.len()];
    for i in 0..code.len() {
        let displacement_len = match code[i] {
            0x70..=0x7F => 1,
            0xE8 | 0xE9 => 4,
            _ => continue,
        };
        for j in 1..=displacement_len {
            if i + j < mask.len() {
                mask[i + j] = 0;
            }
        }
    }
    mask
}
