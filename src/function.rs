//! The per-function record threaded through the pipeline.

use crate::symbols::FunctionMetadata;
use std::fmt;

/// Width of a placeholder variable slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariableWidth {
    Byte = 1,
    Word = 2,
    Dword = 4,
    Qword = 8,
}

impl VariableWidth {
    /// Scan order, widest first.
    pub const SCAN_ORDER: [VariableWidth; 4] = [
        VariableWidth::Qword,
        VariableWidth::Dword,
        VariableWidth::Word,
        VariableWidth::Byte,
    ];

    /// Width in bytes.
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Sentinel base for this width; slot `n` is marked by `base - n`.
    pub fn sentinel_base(self) -> u64 {
        match self {
            VariableWidth::Qword => 0xDEAD_C0DE_BEEF_CAFE,
            VariableWidth::Dword => 0xCAFE_BABE,
            VariableWidth::Word => 0xFACE,
            VariableWidth::Byte => 0xAA,
        }
    }

    /// Sentinel value marking `slot` (1-based).
    pub fn sentinel(self, slot: u32) -> u64 {
        self.sentinel_base().wrapping_sub(slot as u64)
    }
}

/// A placeholder slot found in a function's code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Variable {
    pub width: VariableWidth,
    /// Byte offset into [`Function::bytes`].
    pub offset: u32,
    /// 1-based slot number within this width.
    pub slot: u32,
}

/// An import patch site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicImport {
    pub module: String,
    pub function: String,
    /// Byte offset of the 8-byte absolute address placeholder.
    pub offset: u32,
}

/// Width of every import placeholder.
pub const IMPORT_PLACEHOLDER_WIDTH: u32 = 8;

/// A function extracted from the binary.
#[derive(Clone, Debug)]
pub struct Function {
    pub group: String,
    pub name: String,
    pub bytes: Vec<u8>,
    pub variables: Vec<Variable>,
    pub dynamic_imports: Vec<DynamicImport>,
    pub metadata: FunctionMetadata,
}

impl Function {
    /// `group::name`, used in logs and diagnostics.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.group, self.name)
    }

    /// Total number of fixups.
    pub fn fixup_count(&self) -> usize {
        self.variables.len() + self.dynamic_imports.len()
    }
}

/// A non-fatal condition reported while processing a function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// Qualified name of the function.
    pub function: String,
    /// Stage that raised it.
    pub stage: &'static str,
    pub kind: DiagnosticKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A RIP-relative call, jump or load whose slot is not in the import table.
    UnresolvedImport { offset: u32, slot_rva: u64 },
    /// Decoding stopped at `offset`; the remaining bytes were dropped.
    DecodeTruncation { offset: u32, dropped: usize },
    /// A branch or RIP-relative operand targets a byte inside the function
    /// that is not an instruction boundary; its bytes were kept unchanged.
    UnmappedTarget { offset: u32, target: u64 },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: ", self.function, self.stage)?;
        match &self.kind {
            DiagnosticKind::UnresolvedImport { offset, slot_rva } => write!(
                f,
                "unresolved import slot 0x{:X} at +0x{:X}, kept original instruction",
                slot_rva, offset
            ),
            DiagnosticKind::DecodeTruncation { offset, dropped } => write!(
                f,
                "undecodable instruction at +0x{:X}, dropped {} trailing bytes",
                offset, dropped
            ),
            DiagnosticKind::UnmappedTarget { offset, target } => write!(
                f,
                "target 0x{:X} of instruction at +0x{:X} is not an instruction boundary",
                target, offset
            ),
        }
    }
}
