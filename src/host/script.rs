//! Scancode scripts: hex bytes separated by whitespace or commas, with `#`
//! comments running to the end of the line.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("line {line}: {token:?} is not a hex byte")]
    BadToken { line: usize, token: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One hex byte, with or without a `0x`/`0X` prefix.
pub fn parse_hex_byte(token: &str) -> Option<u8> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u8::from_str_radix(digits, 16).ok()
}

pub fn parse_scancodes(text: &str) -> Result<Vec<u8>, ScriptError> {
    let mut codes = vec![];
    for (index, line) in text.lines().enumerate() {
        let line_content = line.split('#').next().unwrap_or_default();
        for token in line_content
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
        {
            let byte = parse_hex_byte(token).ok_or_else(|| ScriptError::BadToken {
                line: index + 1,
                token: token.to_string(),
            })?;
            codes.push(byte);
        }
    }
    Ok(codes)
}

pub fn load_scancodes(path: &Path) -> Result<Vec<u8>, ScriptError> {
    parse_scancodes(&std::fs::read_to_string(path)?)
}
