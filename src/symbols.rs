//! Function symbol metadata.
//!
//! The pipeline only needs `(name, rva, length)` for each candidate function.
//! [`SymbolProvider`] is the seam for whatever produces those records; the
//! crate ships [`SymbolListing`], which reads them from a plain text listing:
//!
//! ```text
//! # rva      length  qualified name
//! 1040       0x5C    Console:__CODE__Output_impl
//! 10A0       48      Console:__CODE__Clear_impl
//! ```
//!
//! The RVA is always hexadecimal; the length is decimal unless prefixed
//! with `0x`. Everything after the length is the name, spaces included.

use crate::error::{Error, Result};
use std::path::Path;

/// Name, location and size of one function in the source binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionMetadata {
    /// Fully qualified symbol name.
    pub name: String,
    /// Relative virtual address of the first byte.
    pub offset: u32,
    /// Length of the function in bytes.
    pub length: usize,
}

impl FunctionMetadata {
    pub fn new(name: impl Into<String>, offset: u32, length: usize) -> Self {
        Self {
            name: name.into(),
            offset,
            length,
        }
    }
}

/// Source of function metadata for a binary.
pub trait SymbolProvider {
    /// Every function the provider knows about, unfiltered.
    fn functions(&self) -> Result<Vec<FunctionMetadata>>;
}

impl SymbolProvider for Vec<FunctionMetadata> {
    fn functions(&self) -> Result<Vec<FunctionMetadata>> {
        Ok(self.clone())
    }
}

/// Symbols parsed from a text listing.
#[derive(Clone, Debug, Default)]
pub struct SymbolListing {
    entries: Vec<FunctionMetadata>,
}

impl SymbolListing {
    /// Parse a listing from text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (rva, rest) = split_field(line);
            let (length, name) = split_field(rest);

            if name.is_empty() {
                return Err(Error::SymbolParse {
                    line: line_no,
                    reason: "expected '<rva> <length> <name>'".to_string(),
                });
            }

            let rva = rva.trim_start_matches("0x").trim_start_matches("0X");
            let offset = u32::from_str_radix(rva, 16).map_err(|e| Error::SymbolParse {
                line: line_no,
                reason: format!("bad rva '{}': {}", rva, e),
            })?;

            let length = parse_length(length).map_err(|e| Error::SymbolParse {
                line: line_no,
                reason: format!("bad length '{}': {}", length, e),
            })?;

            entries.push(FunctionMetadata::new(name, offset, length));
        }

        tracing::debug!("parsed {} symbols from listing", entries.len());
        Ok(Self { entries })
    }

    /// Read and parse a listing file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SymbolProvider for SymbolListing {
    fn functions(&self) -> Result<Vec<FunctionMetadata>> {
        Ok(self.entries.clone())
    }
}

/// Split off the first whitespace-delimited field.
fn split_field(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim()),
        None => (s, ""),
    }
}

fn parse_length(s: &str) -> std::result::Result<usize, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing() {
        let text = "\
# comment
1040 0x5C Console:__CODE__Output_impl

10A0 48   Console:__CODE__Clear_impl
0x2000 16 operator new[] (unsigned long long)
";
        let listing = SymbolListing::parse(text).unwrap();
        let funcs = listing.functions().unwrap();
        assert_eq!(funcs.len(), 3);
        assert_eq!(funcs[0], FunctionMetadata::new("Console:__CODE__Output_impl", 0x1040, 0x5C));
        assert_eq!(funcs[1].length, 48);
        assert_eq!(funcs[2].offset, 0x2000);
        assert_eq!(funcs[2].name, "operator new[] (unsigned long long)");
    }

    #[test]
    fn test_parse_errors_carry_line() {
        let err = SymbolListing::parse("1000 10 ok\nzzzz 10 bad\n").unwrap_err();
        match err {
            Error::SymbolParse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }

        let err = SymbolListing::parse("1000 10").unwrap_err();
        assert!(matches!(err, Error::SymbolParse { line: 1, .. }));
    }

    #[test]
    fn test_vec_provider() {
        let provider = vec![FunctionMetadata::new("a", 1, 2)];
        assert_eq!(provider.functions().unwrap().len(), 1);
    }
}
