//! x86-64 instruction decoding and basic-block discovery.
//!
//! The decoder is deliberately minimal and table-driven: one opcode byte is
//! read and the decode table supplies the field hints (ModR/M, SIB,
//! displacement, immediate) that determine the rest of the encoded length.
//! Unknown opcodes decode as a single-byte skip so a block walk never gets
//! stuck; truncated instructions decode to length 0 so it never reads past
//! the end of guest memory.

#![forbid(unsafe_code)]

use volans_rules::RuleStore;

/// `RET`: unconditionally transfers control; ends a basic block.
pub const OPCODE_RET: u8 = 0xC3;
/// `JMP rel32`: unconditionally transfers control; ends a basic block.
pub const OPCODE_JMP_REL32: u8 = 0xE9;
/// `CALL rel32` is treated as a block terminator too: control leaves the
/// straight-line run, and keeping the boundary here keeps block extents (and
/// therefore cache hashes) stable.
pub const OPCODE_CALL_REL32: u8 = 0xE8;

/// One decoded instruction.
///
/// A `length` of 0 means the instruction was truncated by the end of the
/// input window; no other field is meaningful in that case.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedInst {
    pub opcode: u8,
    pub modrm: Option<u8>,
    pub sib: Option<u8>,
    pub displacement: Option<i32>,
    pub immediate: Option<i32>,
    pub length: usize,
    /// ModR/M `reg` and `rm` fields, in that order, when a ModR/M byte is
    /// present.
    pub operands: Vec<u8>,
}

impl DecodedInst {
    fn truncated() -> Self {
        Self::default()
    }

    pub fn is_truncated(&self) -> bool {
        self.length == 0
    }

    pub fn is_block_terminator(&self) -> bool {
        matches!(self.opcode, OPCODE_RET | OPCODE_JMP_REL32 | OPCODE_CALL_REL32)
            && !self.is_truncated()
    }
}

/// Decode one instruction at `offset` within `bytes`.
///
/// The slice end is the decode limit; callers narrow it to enforce a window.
pub fn decode(rules: &RuleStore, bytes: &[u8], offset: usize) -> DecodedInst {
    let Some(&opcode) = bytes.get(offset) else {
        return DecodedInst::truncated();
    };

    let mut inst = DecodedInst {
        opcode,
        length: 1,
        ..Default::default()
    };

    let Some(def) = rules.x86_insn(opcode) else {
        // Unknown opcode: single-byte skip, no field decoding.
        return inst;
    };

    if def.has_modrm {
        let Some(&modrm) = bytes.get(offset + inst.length) else {
            return DecodedInst::truncated();
        };
        inst.modrm = Some(modrm);
        inst.length += 1;

        let mode = modrm >> 6;
        let reg = (modrm >> 3) & 0x7;
        let rm = modrm & 0x7;
        inst.operands = vec![reg, rm];

        if def.has_sib && mode != 3 && rm == 4 {
            let Some(&sib) = bytes.get(offset + inst.length) else {
                return DecodedInst::truncated();
            };
            inst.sib = Some(sib);
            inst.length += 1;
        }

        if def.has_displacement {
            match mode {
                1 => {
                    let Some(&disp) = bytes.get(offset + inst.length) else {
                        return DecodedInst::truncated();
                    };
                    inst.displacement = Some(i32::from(disp as i8));
                    inst.length += 1;
                }
                2 => {
                    let Some(disp) = read_i32(bytes, offset + inst.length) else {
                        return DecodedInst::truncated();
                    };
                    inst.displacement = Some(disp);
                    inst.length += 4;
                }
                _ => {}
            }
        }
    }

    if def.has_immediate {
        let Some(imm) = read_i32(bytes, offset + inst.length) else {
            return DecodedInst::truncated();
        };
        inst.immediate = Some(imm);
        inst.length += 4;
    }

    inst
}

fn read_i32(bytes: &[u8], offset: usize) -> Option<i32> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(i32::from_le_bytes(slice.try_into().expect("4-byte slice")))
}

/// Byte budget for a single basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLimits {
    pub max_bytes: usize,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self { max_bytes: 1024 }
    }
}

/// Walk instructions from the start of `bytes` until a block terminator
/// (RET / JMP rel32 / CALL rel32), a truncated instruction, or the byte
/// budget, and return the total block length.
///
/// A zero-length block is valid (the translator renders it as a single host
/// NOP). The sum of the decoded instruction lengths always equals the
/// returned length.
#[must_use]
pub fn analyse_block(rules: &RuleStore, bytes: &[u8], limits: BlockLimits) -> usize {
    let window = &bytes[..bytes.len().min(limits.max_bytes)];
    let mut offset = 0;

    while offset < window.len() {
        let inst = decode(rules, window, offset);
        if inst.is_truncated() {
            break;
        }
        offset += inst.length;
        if inst.is_block_terminator() {
            break;
        }
    }

    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> RuleStore {
        RuleStore::defaults()
    }

    #[test]
    fn decodes_single_byte_nop() {
        let inst = decode(&rules(), &[0x90], 0);
        assert_eq!(inst.opcode, 0x90);
        assert_eq!(inst.length, 1);
        assert!(inst.modrm.is_none());
        assert!(inst.operands.is_empty());
    }

    #[test]
    fn decodes_modrm_register_form() {
        // mov ebx, eax: 89 C3: mod=3, reg=eax(0), rm=ebx(3)
        let inst = decode(&rules(), &[0x89, 0xC3], 0);
        assert_eq!(inst.length, 2);
        assert_eq!(inst.modrm, Some(0xC3));
        assert_eq!(inst.operands, vec![0, 3]);
        assert!(inst.sib.is_none());
        assert!(inst.displacement.is_none());
    }

    #[test]
    fn decodes_sib_and_disp8() {
        // add [rax+rcx*1+0x10], ebx: 01 5C 08 10: mod=1, rm=4 => SIB, disp8
        let inst = decode(&rules(), &[0x01, 0x5C, 0x08, 0x10], 0);
        assert_eq!(inst.length, 4);
        assert_eq!(inst.sib, Some(0x08));
        assert_eq!(inst.displacement, Some(0x10));
    }

    #[test]
    fn decodes_disp32() {
        // mod=2, rm=1: no SIB, four displacement bytes
        let inst = decode(&rules(), &[0x89, 0x91, 0x78, 0x56, 0x34, 0x12], 0);
        assert_eq!(inst.length, 6);
        assert!(inst.sib.is_none());
        assert_eq!(inst.displacement, Some(0x12345678));
    }

    #[test]
    fn decodes_call_with_immediate() {
        let inst = decode(&rules(), &[0xE8, 0xFC, 0xFF, 0xFF, 0xFF], 0);
        assert_eq!(inst.length, 5);
        assert_eq!(inst.immediate, Some(-4));
        assert!(inst.is_block_terminator());
    }

    #[test]
    fn unknown_opcode_is_single_byte_skip() {
        let inst = decode(&rules(), &[0xF4, 0x90], 0);
        assert_eq!(inst.opcode, 0xF4);
        assert_eq!(inst.length, 1);
        assert!(inst.modrm.is_none());
    }

    #[test]
    fn truncated_instruction_has_length_zero() {
        // MOV needs a ModR/M byte that is not there.
        assert!(decode(&rules(), &[0x89], 0).is_truncated());
        // CALL needs four immediate bytes.
        assert!(decode(&rules(), &[0xE8, 0x01], 0).is_truncated());
        // Offset past the end of the window.
        assert!(decode(&rules(), &[0x90], 7).is_truncated());
    }

    #[test]
    fn decode_never_reads_past_the_window() {
        let bytes = [0x90, 0x89, 0xC3, 0x01, 0xC3, 0xC3];
        for offset in 0..=bytes.len() {
            let inst = decode(&rules(), &bytes, offset);
            assert!(offset + inst.length <= bytes.len());
        }
    }

    #[test]
    fn block_ends_at_ret() {
        let bytes = [0x90, 0x89, 0xC3, 0x01, 0xC3, 0xC3, 0x90, 0x90];
        // NOP(1) + MOV(2) + ADD(2) + RET(1) = 6; trailing NOPs belong to the
        // next block.
        assert_eq!(analyse_block(&rules(), &bytes, BlockLimits::default()), 6);
    }

    #[test]
    fn block_ends_at_call_and_jmp() {
        let call = [0x90, 0xE8, 0x00, 0x00, 0x00, 0x00, 0x90];
        assert_eq!(analyse_block(&rules(), &call, BlockLimits::default()), 6);
        let jmp = [0xE9, 0x10, 0x00, 0x00, 0x00, 0x90];
        // JMP rel32 has no immediate hint in the bootstrap table, but it
        // still terminates the walk after its opcode byte.
        assert_eq!(analyse_block(&rules(), &jmp, BlockLimits::default()), 1);
    }

    #[test]
    fn block_respects_byte_budget() {
        let bytes = [0x90; 64];
        assert_eq!(analyse_block(&rules(), &bytes, BlockLimits { max_bytes: 16 }), 16);
    }

    #[test]
    fn truncated_tail_stops_the_walk() {
        // NOP then a MOV missing its ModR/M byte.
        let bytes = [0x90, 0x89];
        assert_eq!(analyse_block(&rules(), &bytes, BlockLimits::default()), 1);
    }

    #[test]
    fn empty_input_is_a_zero_length_block() {
        assert_eq!(analyse_block(&rules(), &[], BlockLimits::default()), 0);
    }

    #[test]
    fn lengths_sum_to_block_length() {
        let rules = rules();
        let bytes = [0x90, 0x01, 0xC3, 0xF4, 0x89, 0xC3, 0xC3];
        let total = analyse_block(&rules, &bytes, BlockLimits::default());
        let mut offset = 0;
        let mut sum = 0;
        while offset < total {
            let inst = decode(&rules, &bytes[..total], offset);
            assert!(!inst.is_truncated());
            sum += inst.length;
            offset += inst.length;
        }
        assert_eq!(sum, total);
    }
}
