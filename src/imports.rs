//! Import table walking and import call-site rewriting.
//!
//! Calls through the import address table only work inside the host
//! binary. Each such site is replaced by a stub that loads an absolute
//! address from an 8-byte placeholder, which the loader of the extracted
//! code patches at runtime:
//!
//! ```text
//! call [rip+slot]      ->  mov rax, 0 (imm64) ; call rax
//! jmp  [rip+slot]      ->  mov rax, 0 (imm64) ; jmp rax
//! mov  reg, [rip+slot] ->  mov reg, 0 (imm64)
//! ```

use crate::emit::Emitter;
use crate::error::{Error, Result};
use crate::fixup;
use crate::function::{Diagnostic, DiagnosticKind, DynamicImport, Function};
use crate::pe::{ImportDescriptor, MappedImage, DIRECTORY_ENTRY_IMPORT};
use crate::stream::{self, DecodedStream};

use iced_x86::{Code, Instruction, Register};
use std::collections::BTreeMap;

/// Stage name used in diagnostics and errors.
pub const STAGE: &str = "imports";

/// Offset of the address placeholder inside every stub.
pub const PLACEHOLDER_OFFSET: u32 = 2;

const ORDINAL_FLAG: u64 = 1 << 63;
const MAX_THUNKS_PER_MODULE: u32 = 0x10000;
// Bit 31 of a name thunk is reserved; the hint/name RVA sits below it
const HINT_NAME_RVA_MASK: u32 = 0x7FFF_FFFF;

/// `module!function` for one import slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportName {
    pub module: String,
    pub function: String,
}

/// Import address table slots of a binary, keyed by slot RVA.
#[derive(Clone, Debug, Default)]
pub struct ImportTable {
    slots: BTreeMap<u32, ImportName>,
}

impl ImportTable {
    /// Walk the import directory of `image`.
    ///
    /// Ordinal imports have no name and are skipped. An image without an
    /// import directory yields an empty table.
    pub fn from_image(image: &MappedImage) -> Result<Self> {
        let mut table = Self::default();
        let Some(dir) = image.headers().data_directory(DIRECTORY_ENTRY_IMPORT) else {
            tracing::debug!("image has no import directory");
            return Ok(table);
        };

        let descriptor_size = std::mem::size_of::<ImportDescriptor>() as u32;
        let count = dir.size / descriptor_size;
        for i in 0..count {
            let desc_rva = dir
                .virtual_address
                .checked_add(i * descriptor_size)
                .ok_or_else(|| {
                    Error::MalformedImage(format!("import descriptor {} lies past 4 GiB", i))
                })?;
            let desc: ImportDescriptor = image.read_struct(desc_rva)?;
            if desc.is_terminator() {
                break;
            }

            let Some(module) = image.c_str(desc.name) else {
                tracing::warn!("import descriptor {} has an unreadable module name", i);
                continue;
            };

            let first_thunk = desc.first_thunk;
            let lookup = match desc.original_first_thunk {
                0 => first_thunk,
                oft => oft,
            };

            for j in 0..MAX_THUNKS_PER_MODULE {
                let (Some(entry), Some(slot)) =
                    (lookup.checked_add(j * 8), first_thunk.checked_add(j * 8))
                else {
                    break;
                };
                let Some(thunk) = image.read_u64(entry) else {
                    break;
                };
                if thunk == 0 {
                    break;
                }
                if thunk & ORDINAL_FLAG != 0 {
                    continue;
                }

                // IMAGE_IMPORT_BY_NAME: u16 hint, then the name
                let hint_name = thunk as u32 & HINT_NAME_RVA_MASK;
                let Some(function) = hint_name.checked_add(2).and_then(|rva| image.c_str(rva)) else {
                    continue;
                };
                table.insert(slot, &module, &function);
            }
        }

        tracing::info!("import table: {} named slots", table.len());
        Ok(table)
    }

    /// Build a table from explicit `(slot_rva, module, function)` entries.
    #[cfg(test)]
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (u32, &'a str, &'a str)>) -> Self {
        let mut table = Self::default();
        for (slot, module, function) in entries {
            table.insert(slot, module, function);
        }
        table
    }

    fn insert(&mut self, slot: u32, module: &str, function: &str) {
        self.slots.insert(
            slot,
            ImportName {
                module: module.to_string(),
                function: function.to_string(),
            },
        );
    }

    pub fn lookup(&self, slot_rva: u32) -> Option<&ImportName> {
        self.slots.get(&slot_rva)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots in RVA order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &ImportName)> + '_ {
        self.slots.iter().map(|(slot, name)| (*slot, name))
    }
}

// ============================================================================
// Call-site Rewriting
// ============================================================================

/// How an instruction uses an import slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SiteKind {
    Call,
    Jump,
    Load(Register),
}

fn classify(instr: &Instruction) -> Option<SiteKind> {
    if !instr.is_ip_rel_memory_operand() {
        return None;
    }
    match instr.code() {
        Code::Call_rm64 => Some(SiteKind::Call),
        Code::Jmp_rm64 => Some(SiteKind::Jump),
        Code::Mov_r64_rm64 => Some(SiteKind::Load(instr.op0_register())),
        _ => None,
    }
}

/// Assemble the stub for a site; the placeholder is zero.
fn build_stub(kind: SiteKind) -> Result<Vec<u8>> {
    let mut em = Emitter::new()?;
    match kind {
        SiteKind::Call => {
            em.mov_imm64(Register::RAX, 0)?;
            em.call_reg(Register::RAX)?;
        }
        SiteKind::Jump => {
            em.mov_imm64(Register::RAX, 0)?;
            em.jmp_reg(Register::RAX)?;
        }
        SiteKind::Load(reg) => em.mov_imm64(reg, 0)?,
    }
    em.finish()
}

/// Statistics from rewriting one function.
#[derive(Default, Debug, Clone)]
pub struct ImportStats {
    pub instructions: usize,
    pub calls_rewritten: usize,
    pub jumps_rewritten: usize,
    pub loads_rewritten: usize,
    pub unresolved: usize,
    pub branches_relocated: usize,
}

impl ImportStats {
    pub fn rewritten(&self) -> usize {
        self.calls_rewritten + self.jumps_rewritten + self.loads_rewritten
    }
}

/// Rewrites import references of functions from one image.
pub struct ImportResolver<'a> {
    table: &'a ImportTable,
}

impl<'a> ImportResolver<'a> {
    pub fn new(table: &'a ImportTable) -> Self {
        Self { table }
    }

    /// Replace every resolvable import reference in `function` with a stub
    /// and record a [`DynamicImport`] for its placeholder.
    pub fn resolve(
        &self,
        function: &mut Function,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<ImportStats> {
        let decoded: DecodedStream = stream::decode_stream(&function.bytes);
        let function_rva = function.metadata.offset as u64;
        let qualified = function.qualified_name();

        let mut stats = ImportStats::default();
        let mut found: Vec<(usize, ImportName)> = Vec::new();
        let mut unresolved: Vec<Diagnostic> = Vec::new();

        let summary = stream::rewrite(function, &decoded, STAGE, diagnostics, |builder, site| {
            let Some(kind) = classify(site.instr) else {
                builder.push_instruction(site.instr, site.bytes);
                return Ok(());
            };

            let slot_rva = function_rva.wrapping_add(site.instr.ip_rel_memory_address());
            let name = u32::try_from(slot_rva)
                .ok()
                .and_then(|slot| self.table.lookup(slot));

            let Some(name) = name else {
                stats.unresolved += 1;
                unresolved.push(Diagnostic {
                    function: qualified.clone(),
                    stage: STAGE,
                    kind: DiagnosticKind::UnresolvedImport {
                        offset: site.offset,
                        slot_rva,
                    },
                });
                builder.push_instruction(site.instr, site.bytes);
                return Ok(());
            };

            let piece = builder.push_bytes(build_stub(kind)?);
            found.push((builder.mark(piece, PLACEHOLDER_OFFSET), name.clone()));
            match kind {
                SiteKind::Call => stats.calls_rewritten += 1,
                SiteKind::Jump => stats.jumps_rewritten += 1,
                SiteKind::Load(_) => stats.loads_rewritten += 1,
            }
            tracing::debug!(
                "{}: +0x{:X} -> {}!{}",
                qualified,
                site.offset,
                name.module,
                name.function
            );
            Ok(())
        })?;

        for diag in unresolved {
            tracing::warn!("{}", diag);
            diagnostics.push(diag);
        }

        for (mark, name) in found {
            function.dynamic_imports.push(DynamicImport {
                module: name.module,
                function: name.function,
                offset: summary.marks[mark],
            });
        }
        fixup::validate_bounds(function)?;

        stats.instructions = summary.instructions;
        stats.branches_relocated = summary.relocated;
        Ok(stats)
    }
}
