//! Guest→host register map.
//!
//! Informational for the translator (rules carry literal encodings), but
//! authoritative for CPU-state marshalling: the orchestrator copies exactly
//! the registers named here when entering and leaving translated code.

use crate::error::{Result, RuleError};
use crate::parse::data_lines;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegMapping {
    pub x86: String,
    pub a64: String,
    pub description: String,
}

/// Format: `x86_name arm_name description`; the description runs to end of line.
pub(crate) fn parse_table(file: &str, text: &str) -> Result<Vec<RegMapping>> {
    let mut out = Vec::new();
    for (line, data) in data_lines(text) {
        let mut tokens = data.split_whitespace();
        let (Some(x86), Some(a64)) = (tokens.next(), tokens.next()) else {
            return Err(RuleError::parse(file, line, "expected x86 and arm register names"));
        };
        out.push(RegMapping {
            x86: x86.to_string(),
            a64: a64.to_string(),
            description: tokens.collect::<Vec<_>>().join(" "),
        });
    }
    Ok(out)
}

pub(crate) fn default_table() -> Vec<RegMapping> {
    fn map(x86: &str, a64: &str, description: &str) -> RegMapping {
        RegMapping {
            x86: x86.to_string(),
            a64: a64.to_string(),
            description: description.to_string(),
        }
    }

    vec![
        map("rax", "x0", "accumulator / return value"),
        map("rbx", "x1", "callee-saved base"),
        map("rcx", "x2", "counter"),
        map("rdx", "x3", "data"),
        map("rsi", "x4", "source index"),
        map("rdi", "x5", "destination index"),
        map("rbp", "x6", "frame base"),
        map("rsp", "sp", "stack pointer"),
        map("r8", "x8", "general purpose"),
        map("r9", "x9", "general purpose"),
        map("r10", "x10", "general purpose"),
        map("r11", "x11", "general purpose"),
        map("r12", "x12", "general purpose"),
        map("r13", "x13", "general purpose"),
        map("r14", "x14", "general purpose"),
        map("r15", "x15", "general purpose"),
        map("rip", "pc", "program counter"),
        map("rflags", "pstate", "condition flags"),
    ]
}

pub(crate) fn render_table(mappings: &[RegMapping]) -> String {
    let mut out = String::from("# Register map\n# x86_name arm_name description\n");
    for m in mappings {
        out.push_str(&format!("{} {} {}\n", m.x86, m.a64, m.description));
    }
    out
}
