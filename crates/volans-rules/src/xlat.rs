//! Translation rule table: x86 opcode → literal AArch64 word sequence.

use crate::error::{Result, RuleError};
use crate::parse::{described_lines, parse_hex_u32, parse_hex_u8};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationRule {
    pub x86_opcode: u8,
    pub host_words: Vec<u32>,
    pub description: String,
}

/// Format: `x86_opcode arm_word_1 arm_word_2 … # description`.
pub(crate) fn parse_table(file: &str, text: &str) -> Result<Vec<TranslationRule>> {
    let mut out = Vec::new();
    for (line, fields, desc) in described_lines(text) {
        let mut tokens = fields.split_whitespace();
        let opcode_tok = tokens.next().expect("described_lines yields non-empty fields");
        let x86_opcode = parse_hex_u8(opcode_tok)
            .ok_or_else(|| RuleError::parse(file, line, format!("bad opcode {opcode_tok:?}")))?;

        let mut host_words = Vec::new();
        for token in tokens {
            let word = parse_hex_u32(token)
                .ok_or_else(|| RuleError::parse(file, line, format!("bad host word {token:?}")))?;
            host_words.push(word);
        }
        if host_words.is_empty() {
            return Err(RuleError::parse(file, line, "rule has no host words"));
        }

        out.push(TranslationRule {
            x86_opcode,
            host_words,
            description: desc.to_string(),
        });
    }
    Ok(out)
}

pub(crate) fn default_table() -> Vec<TranslationRule> {
    fn rule(x86_opcode: u8, host_words: &[u32], description: &str) -> TranslationRule {
        TranslationRule {
            x86_opcode,
            host_words: host_words.to_vec(),
            description: description.to_string(),
        }
    }

    vec![
        rule(0x90, &[0xD503201F], "NOP -> NOP"),
        rule(0x89, &[0xAA0003E0], "MOV reg, reg -> MOV X0, X0"),
        rule(0x01, &[0x8B010000], "ADD reg, reg -> ADD X0, X0, X1"),
        rule(0x29, &[0xCB010000], "SUB reg, reg -> SUB X0, X0, X1"),
        rule(
            0xE8,
            &[0xF81F0FE0, 0x94000000],
            "CALL -> STR X0, [SP, -16]! + BL",
        ),
        rule(
            0xC3,
            &[0xF84107E0, 0xD65F03C0],
            "RET -> LDR X0, [SP], 16 + RET",
        ),
        rule(0x0F, &[0x4EA01C00], "SIMD prefix -> MOV NEON"),
    ]
}

pub(crate) fn render_table(rules: &[TranslationRule]) -> String {
    let mut out = String::from(
        "# Translation rule table\n# x86_opcode arm_word_1 arm_word_2 ... # description\n",
    );
    for rule in rules {
        out.push_str(&format!("0x{:02X}", rule.x86_opcode));
        for word in &rule.host_words {
            out.push_str(&format!(" 0x{word:08X}"));
        }
        out.push_str(&format!(" # {}\n", rule.description));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_defaults() {
        let table = default_table();
        let parsed = parse_table("translation_rules.txt", &render_table(&table)).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn keeps_rule_order() {
        let text = "0x90 0xD503201F # first\n0x90 0xDEADBEEF # shadowed duplicate\n";
        let parsed = parse_table("t", text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].host_words, vec![0xD503201F]);
        assert_eq!(parsed[0].description, "first");
    }

    #[test]
    fn rejects_rule_without_host_words() {
        let err = parse_table("t", "0x90 # lonely opcode\n").unwrap_err();
        assert!(err.to_string().contains("no host words"));
    }
}
