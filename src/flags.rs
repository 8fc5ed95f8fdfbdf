//! Status flag liveness.
//!
//! Several rewrites compute the same register result as the instruction they
//! replace but leave different status flags behind. They are only legal when
//! nothing reads the flags before they are next overwritten, which this
//! backward pass over the linear instruction stream approximates.

use iced_x86::{FlowControl, Instruction, RflagsBits};

/// OF, SF, ZF, AF, CF and PF.
pub const STATUS_FLAGS: u32 = RflagsBits::OF
    | RflagsBits::SF
    | RflagsBits::ZF
    | RflagsBits::AF
    | RflagsBits::CF
    | RflagsBits::PF;

/// Per-instruction flag liveness.
#[derive(Clone, Debug, Default)]
pub struct FlagLiveness {
    live_before: Vec<bool>,
    live_after: Vec<bool>,
}

impl FlagLiveness {
    /// Analyze `instructions` in program order.
    ///
    /// Flags are dead after `ret` and `call` (not preserved across calls),
    /// and assumed live after any jump and at the end of the stream.
    pub fn analyze(instructions: &[Instruction]) -> Self {
        let n = instructions.len();
        let mut live_before = vec![true; n];
        let mut live_after = vec![true; n];
        let mut live = true;

        for (i, instr) in instructions.iter().enumerate().rev() {
            let after = match instr.flow_control() {
                FlowControl::Next => live,
                FlowControl::Return | FlowControl::Call | FlowControl::IndirectCall => false,
                _ => true,
            };

            let reads = instr.rflags_read() & STATUS_FLAGS != 0;
            let writes_all = instr.rflags_modified() & STATUS_FLAGS == STATUS_FLAGS;
            let before = reads || (!writes_all && after);

            live_after[i] = after;
            live_before[i] = before;
            live = before;
        }

        Self {
            live_before,
            live_after,
        }
    }

    /// Whether flags may be read once instruction `index` starts.
    pub fn live_before(&self, index: usize) -> bool {
        self.live_before.get(index).copied().unwrap_or(true)
    }

    /// Whether flags may be read once instruction `index` completes.
    pub fn live_after(&self, index: usize) -> bool {
        self.live_after.get(index).copied().unwrap_or(true)
    }
}
