//! Placeholder variable discovery.
//!
//! Code authors mark runtime-patched values with sentinel constants, one
//! family per width, counting down from a base: the first 4-byte slot is
//! `0xCAFEBABE - 1`, the second `0xCAFEBABE - 2`, and so on. Widths are
//! scanned widest first so a narrow pattern never matches inside a wide one.

use crate::function::{Function, Variable, VariableWidth};

/// Upper bound on slots searched per width.
pub const MAX_SLOTS_PER_WIDTH: u32 = 100;

/// Statistics from scanning one function.
#[derive(Default, Debug, Clone)]
pub struct VariableStats {
    /// Distinct slots found, per width (1, 2, 4, 8 bytes).
    pub slots: [u32; 4],
    /// Total occurrences recorded.
    pub occurrences: usize,
}

impl VariableStats {
    fn width_index(width: VariableWidth) -> usize {
        match width {
            VariableWidth::Byte => 0,
            VariableWidth::Word => 1,
            VariableWidth::Dword => 2,
            VariableWidth::Qword => 3,
        }
    }

    pub fn slots_of(&self, width: VariableWidth) -> u32 {
        self.slots[Self::width_index(width)]
    }
}

fn read_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Record and zero every occurrence of `value` in `bytes`.
fn take_occurrences(bytes: &mut [u8], width: VariableWidth, value: u64) -> Vec<u32> {
    let w = width.bytes();
    let mut hits = Vec::new();
    let mut i = 0;
    while i + w <= bytes.len() {
        if read_le(&bytes[i..i + w]) == value {
            hits.push(i as u32);
            bytes[i..i + w].fill(0);
            i += w;
        } else {
            i += 1;
        }
    }
    hits
}

/// Find every sentinel in `function`, zero it and record a [`Variable`].
pub fn scan_variables(function: &mut Function) -> VariableStats {
    let mut stats = VariableStats::default();

    for width in VariableWidth::SCAN_ORDER {
        let mut slot = 1;
        while slot <= MAX_SLOTS_PER_WIDTH {
            let value = width.sentinel(slot);
            let hits = take_occurrences(&mut function.bytes, width, value);
            if hits.is_empty() {
                break;
            }

            tracing::debug!(
                "{}: {}-byte slot {} at {:X?}",
                function.qualified_name(),
                width.bytes(),
                slot,
                hits
            );
            stats.occurrences += hits.len();
            function
                .variables
                .extend(hits.into_iter().map(|offset| Variable {
                    width,
                    offset,
                    slot,
                }));
            slot += 1;
        }
        stats.slots[VariableStats::width_index(width)] = slot - 1;
    }

    stats
}
