//! Fixup tracking.
//!
//! A fixup is a byte range inside a function's code that an external loader
//! patches: a variable slot or an import address placeholder. Rewriting
//! stages look fixups up by their pre-rewrite offset and report where each
//! one landed.

use crate::error::{Error, Result};
use crate::function::{Function, IMPORT_PLACEHOLDER_WIDTH};
use std::collections::BTreeMap;

/// The kind of fixup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixupKind {
    /// Placeholder variable slot.
    Variable,
    /// Import address placeholder.
    DynamicImport,
}

/// A fixup as seen by a rewriting stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixupRef {
    pub kind: FixupKind,
    /// Index into the function's `variables` or `dynamic_imports`.
    pub index: usize,
    /// Pre-rewrite byte offset.
    pub offset: u32,
    /// Width in bytes.
    pub width: u32,
}

impl FixupRef {
    fn end(&self) -> u32 {
        self.offset.saturating_add(self.width)
    }
}

/// Fixups of one function, indexed by pre-rewrite offset.
#[derive(Clone, Debug, Default)]
pub struct FixupMap {
    by_offset: BTreeMap<u32, Vec<FixupRef>>,
    max_width: u32,
}

impl FixupMap {
    /// Snapshot the fixups of `function`.
    pub fn from_function(function: &Function) -> Self {
        let mut map = Self::default();
        for (index, var) in function.variables.iter().enumerate() {
            map.insert(FixupRef {
                kind: FixupKind::Variable,
                index,
                offset: var.offset,
                width: var.width.bytes() as u32,
            });
        }
        for (index, import) in function.dynamic_imports.iter().enumerate() {
            map.insert(FixupRef {
                kind: FixupKind::DynamicImport,
                index,
                offset: import.offset,
                width: IMPORT_PLACEHOLDER_WIDTH,
            });
        }
        map
    }

    /// Add a fixup. Overlap between a variable and an import is logged.
    pub fn insert(&mut self, fixup: FixupRef) {
        let clash = self
            .overlapping(fixup.offset, fixup.width as usize)
            .any(|other| other.kind != fixup.kind);
        if clash {
            tracing::warn!(
                "{:?} fixup at +0x{:X} overlaps a fixup of another kind",
                fixup.kind,
                fixup.offset
            );
        }
        self.max_width = self.max_width.max(fixup.width);
        self.by_offset.entry(fixup.offset).or_default().push(fixup);
    }

    /// Every fixup intersecting `[start, start + len)`.
    pub fn overlapping(&self, start: u32, len: usize) -> impl Iterator<Item = &FixupRef> + '_ {
        let end = start.saturating_add(len as u32);
        let lower = start.saturating_sub(self.max_width.saturating_sub(1));
        self.by_offset
            .range(lower..end)
            .flat_map(|(_, fixups)| fixups.iter())
            .filter(move |f| f.offset < end && f.end() > start && len > 0)
    }

    /// Number of fixups.
    pub fn len(&self) -> usize {
        self.by_offset.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    /// Iterate in offset order.
    pub fn iter(&self) -> impl Iterator<Item = &FixupRef> + '_ {
        self.by_offset.values().flat_map(|fixups| fixups.iter())
    }
}

/// Check that every fixup of `function` lies entirely inside its bytes.
pub fn validate_bounds(function: &Function) -> Result<()> {
    let len = function.bytes.len();
    let ranges = function
        .variables
        .iter()
        .map(|v| (v.offset, v.width.bytes() as u32))
        .chain(
            function
                .dynamic_imports
                .iter()
                .map(|i| (i.offset, IMPORT_PLACEHOLDER_WIDTH)),
        );

    for (offset, width) in ranges {
        if offset as usize + width as usize > len {
            return Err(Error::FixupOutOfBounds { offset, width, len });
        }
    }
    Ok(())
}

/// Move every fixup of `function` to its post-rewrite offset.
pub fn apply_remap(function: &mut Function, remapped: &[(FixupRef, u32)]) {
    for (fixup, new_offset) in remapped {
        match fixup.kind {
            FixupKind::Variable => {
                if let Some(var) = function.variables.get_mut(fixup.index) {
                    var.offset = *new_offset;
                }
            }
            FixupKind::DynamicImport => {
                if let Some(import) = function.dynamic_imports.get_mut(fixup.index) {
                    import.offset = *new_offset;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{DynamicImport, Variable, VariableWidth};
    use crate::symbols::FunctionMetadata;

    fn sample() -> Function {
        Function {
            group: "g".into(),
            name: "f".into(),
            bytes: vec![0; 32],
            variables: vec![Variable {
                width: VariableWidth::Dword,
                offset: 4,
                slot: 1,
            }],
            dynamic_imports: vec![DynamicImport {
                module: "kernel32.dll".into(),
                function: "Sleep".into(),
                offset: 20,
            }],
            metadata: FunctionMetadata::new("g:f", 0x1000, 32),
        }
    }

    #[test]
    fn test_overlap_lookup() {
        let map = FixupMap::from_function(&sample());
        assert_eq!(map.len(), 2);

        // Instruction [2, 6) covers the start of the variable
        let hits: Vec<_> = map.overlapping(2, 4).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, FixupKind::Variable);

        // Instruction [7, 9) covers only the tail of the variable
        assert_eq!(map.overlapping(7, 2).count(), 1);

        // Instruction [8, 20) touches nothing
        assert_eq!(map.overlapping(8, 12).count(), 0);

        // Import spans [20, 28)
        assert_eq!(map.overlapping(27, 1).count(), 1);
        assert_eq!(map.overlapping(28, 4).count(), 0);
    }

    #[test]
    fn test_validate_bounds() {
        let mut f = sample();
        assert!(validate_bounds(&f).is_ok());
        f.dynamic_imports[0].offset = 25;
        assert!(matches!(
            validate_bounds(&f),
            Err(Error::FixupOutOfBounds { offset: 25, .. })
        ));
    }

    #[test]
    fn test_apply_remap() {
        let mut f = sample();
        let map = FixupMap::from_function(&f);
        let remapped: Vec<_> = map.iter().map(|r| (*r, r.offset + 3)).collect();
        apply_remap(&mut f, &remapped);
        assert_eq!(f.variables[0].offset, 7);
        assert_eq!(f.dynamic_imports[0].offset, 23);
    }
}
