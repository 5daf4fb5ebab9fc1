//! AArch64 encoding table.
//!
//! Advisory data: the translator emits literal host words from the
//! translation rules, and this table only backs diagnostics (naming a host
//! word when tracing or dumping a translated block).

use crate::error::{Result, RuleError};
use crate::parse::{data_lines, parse_u32_field};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct A64Encoding {
    pub opcode: u32,
    pub mnemonic: String,
    /// Bits that identify the instruction class.
    pub mask: u32,
    /// Expected value of the masked bits.
    pub value: u32,
}

impl A64Encoding {
    /// Whether `word` belongs to this encoding class.
    pub fn matches(&self, word: u32) -> bool {
        word & self.mask == self.value
    }
}

/// Format: `opcode mnemonic mask value`, numeric fields hex (`0x`) or decimal.
pub(crate) fn parse_table(file: &str, text: &str) -> Result<Vec<A64Encoding>> {
    let mut out = Vec::new();
    for (line, data) in data_lines(text) {
        let fields: Vec<&str> = data.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(RuleError::parse(
                file,
                line,
                format!("expected 4 fields, found {}", fields.len()),
            ));
        }
        let [opcode, mask, value] = [fields[0], fields[2], fields[3]].map(parse_u32_field);
        let (Some(opcode), Some(mask), Some(value)) = (opcode, mask, value) else {
            return Err(RuleError::parse(file, line, "bad numeric field"));
        };
        out.push(A64Encoding {
            opcode,
            mnemonic: fields[1].to_string(),
            mask,
            value,
        });
    }
    Ok(out)
}

pub(crate) fn default_table() -> Vec<A64Encoding> {
    fn enc(opcode: u32, mnemonic: &str, mask: u32, value: u32) -> A64Encoding {
        A64Encoding {
            opcode,
            mnemonic: mnemonic.to_string(),
            mask,
            value,
        }
    }

    vec![
        enc(0xD503201F, "NOP", 0xFFFFFFFF, 0xD503201F),
        enc(0xAA0003E0, "MOV", 0xFFE0FFFF, 0xAA0003E0),
        enc(0x8B010000, "ADD", 0xFFE0FC00, 0x8B010000),
        enc(0xCB010000, "SUB", 0xFFE0FC00, 0xCB010000),
    ]
}

pub(crate) fn render_table(encodings: &[A64Encoding]) -> String {
    let mut sorted: Vec<&A64Encoding> = encodings.iter().collect();
    sorted.sort_by_key(|e| e.opcode);

    let mut out = String::from("# AArch64 encoding table\n# opcode mnemonic mask value\n");
    for e in sorted {
        out.push_str(&format!(
            "0x{:08X} {} 0x{:08X} 0x{:08X}\n",
            e.opcode, e.mnemonic, e.mask, e.value
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_defaults() {
        let table = default_table();
        let parsed = parse_table("arm_defs.txt", &render_table(&table)).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn accepts_decimal_fields() {
        let parsed = parse_table("t", "3573751839 NOP 4294967295 3573751839\n").unwrap();
        assert_eq!(parsed[0].opcode, 0xD503201F);
        assert!(parsed[0].matches(0xD503201F));
        assert!(!parsed[0].matches(0xD503201E));
    }

    #[test]
    fn class_match_respects_mask() {
        let add = &default_table()[2];
        // Any Rd/Rn/Rm assignment of the ADD (shifted register) class matches.
        assert!(add.matches(0x8B010000));
        assert!(add.matches(0x8B01001F));
        assert!(!add.matches(0xCB010000));
    }
}
