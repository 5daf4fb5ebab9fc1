//! Shared lexing helpers for the whitespace-delimited table formats.

/// Iterate over the data lines of a table file.
///
/// `#` starts a comment running to end of line; blank lines are skipped.
/// Yields `(1-based line number, trimmed text)`. Tables whose lines carry an
/// inline `# description` field (translation rules, peephole patterns) split
/// on `#` themselves instead of using this.
pub(crate) fn data_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines().enumerate().filter_map(|(idx, raw)| {
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            None
        } else {
            Some((idx + 1, line))
        }
    })
}

/// Like [`data_lines`] but keeps the `# description` tail: yields
/// `(line number, fields text, description)`. Lines that are pure comments or
/// blank are skipped.
pub(crate) fn described_lines(text: &str) -> impl Iterator<Item = (usize, &str, &str)> {
    text.lines().enumerate().filter_map(|(idx, raw)| {
        let (fields, desc) = match raw.find('#') {
            Some(pos) => (&raw[..pos], raw[pos + 1..].trim()),
            None => (raw, ""),
        };
        let fields = fields.trim();
        if fields.is_empty() {
            None
        } else {
            Some((idx + 1, fields, desc))
        }
    })
}

fn strip_hex_prefix(token: &str) -> &str {
    token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token)
}

pub(crate) fn parse_hex_u8(token: &str) -> Option<u8> {
    u8::from_str_radix(strip_hex_prefix(token), 16).ok()
}

pub(crate) fn parse_hex_u32(token: &str) -> Option<u32> {
    u32::from_str_radix(strip_hex_prefix(token), 16).ok()
}

/// Hex when `0x`-prefixed, decimal otherwise.
pub(crate) fn parse_u32_field(token: &str) -> Option<u32> {
    if token.starts_with("0x") || token.starts_with("0X") {
        u32::from_str_radix(&token[2..], 16).ok()
    } else {
        token.parse().ok()
    }
}

pub(crate) fn parse_flag(token: &str) -> Option<bool> {
    match token {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}
