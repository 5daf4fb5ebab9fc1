//! x86 decode table: per-opcode hints consumed by the instruction decoder.

use crate::error::{Result, RuleError};
use crate::parse::{data_lines, parse_flag, parse_hex_u8};

/// Decode hints for one single-byte opcode.
///
/// `size` is the nominal encoded length and is informational; the decoder
/// derives the actual length from the field flags and the ModR/M byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X86Insn {
    pub opcode: u8,
    pub mnemonic: String,
    pub size: u8,
    pub has_modrm: bool,
    pub has_sib: bool,
    pub has_displacement: bool,
    pub has_immediate: bool,
}

/// Format: `opcode mnemonic size has_modrm has_sib has_displacement has_immediate`.
pub(crate) fn parse_table(file: &str, text: &str) -> Result<Vec<X86Insn>> {
    let mut out = Vec::new();
    for (line, data) in data_lines(text) {
        let fields: Vec<&str> = data.split_whitespace().collect();
        if fields.len() != 7 {
            return Err(RuleError::parse(
                file,
                line,
                format!("expected 7 fields, found {}", fields.len()),
            ));
        }
        let opcode = parse_hex_u8(fields[0])
            .ok_or_else(|| RuleError::parse(file, line, format!("bad opcode {:?}", fields[0])))?;
        let size: u8 = fields[2]
            .parse()
            .map_err(|_| RuleError::parse(file, line, format!("bad size {:?}", fields[2])))?;
        let mut flags = [false; 4];
        for (slot, token) in flags.iter_mut().zip(&fields[3..7]) {
            *slot = parse_flag(token)
                .ok_or_else(|| RuleError::parse(file, line, format!("bad flag {token:?}")))?;
        }
        out.push(X86Insn {
            opcode,
            mnemonic: fields[1].to_string(),
            size,
            has_modrm: flags[0],
            has_sib: flags[1],
            has_displacement: flags[2],
            has_immediate: flags[3],
        });
    }
    Ok(out)
}

pub(crate) fn default_table() -> Vec<X86Insn> {
    fn insn(
        opcode: u8,
        mnemonic: &str,
        size: u8,
        modrm: bool,
        sib: bool,
        disp: bool,
        imm: bool,
    ) -> X86Insn {
        X86Insn {
            opcode,
            mnemonic: mnemonic.to_string(),
            size,
            has_modrm: modrm,
            has_sib: sib,
            has_displacement: disp,
            has_immediate: imm,
        }
    }

    vec![
        insn(0x90, "NOP", 1, false, false, false, false),
        insn(0x89, "MOV", 2, true, true, true, false),
        insn(0x01, "ADD", 2, true, true, true, false),
        insn(0x29, "SUB", 2, true, true, true, false),
        insn(0xE8, "CALL", 5, false, false, false, true),
        insn(0xC3, "RET", 1, false, false, false, false),
        insn(0x0F, "SIMD_PREFIX", 1, false, false, false, false),
    ]
}

pub(crate) fn render_table(insns: &[X86Insn]) -> String {
    let mut sorted: Vec<&X86Insn> = insns.iter().collect();
    sorted.sort_by_key(|i| i.opcode);

    let mut out = String::from(
        "# x86 decode table\n\
         # opcode mnemonic size has_modrm has_sib has_displacement has_immediate\n",
    );
    for i in sorted {
        out.push_str(&format!(
            "0x{:02X} {} {} {} {} {} {}\n",
            i.opcode,
            i.mnemonic,
            i.size,
            u8::from(i.has_modrm),
            u8::from(i.has_sib),
            u8::from(i.has_displacement),
            u8::from(i.has_immediate),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_render() {
        let table = default_table();
        let text = render_table(&table);
        let mut parsed = parse_table("x86_defs.txt", &text).unwrap();
        parsed.sort_by_key(|i| i.opcode);
        let mut expected = table;
        expected.sort_by_key(|i| i.opcode);
        assert_eq!(parsed, expected);
    }

    #[test]
    fn skips_comments_and_blanks() {
        let text = "# header\n\n0x90 NOP 1 0 0 0 0   # trailing comment\n";
        let parsed = parse_table("t", text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].opcode, 0x90);
        assert!(!parsed[0].has_modrm);
    }

    #[test]
    fn reports_line_numbers_on_malformed_input() {
        let text = "# ok\n0x90 NOP 1 0 0 0 0\n0x89 MOV 2 1 1\n";
        let err = parse_table("x86_defs.txt", text).unwrap_err();
        match err {
            RuleError::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_bad_flag_values() {
        let err = parse_table("t", "0x90 NOP 1 0 0 yes 0\n").unwrap_err();
        assert!(err.to_string().contains("bad flag"));
    }
}
