//! Junk instruction generation.

use crate::emit::{any_scratch, Emitter};
use crate::error::Result;

use rand::rngs::StdRng;
use rand::Rng;

/// `nop dword ptr [rax]`
const MULTI_BYTE_NOP: [u8; 3] = [0x0F, 0x1F, 0x00];

/// Junk that leaves registers, memory and flags untouched.
const NEUTRAL_KINDS: u32 = 6;
/// Junk that only clobbers status flags.
const FLAG_CLOBBER_KINDS: u32 = 2;

/// Emit 1-3 junk instructions.
///
/// Flag-clobbering forms (`test`, `cmp`) are only picked when
/// `flags_dead` says nothing reads the flags before they are rewritten.
pub fn emit_junk(em: &mut Emitter, rng: &mut StdRng, flags_dead: bool) -> Result<usize> {
    let count = rng.random_range(1..=3);
    let kinds = if flags_dead {
        NEUTRAL_KINDS + FLAG_CLOBBER_KINDS
    } else {
        NEUTRAL_KINDS
    };

    for _ in 0..count {
        let reg = any_scratch(rng).r64;
        match rng.random_range(0..kinds) {
            0 => em.nop()?,
            1 => {
                em.push(reg)?;
                em.pop(reg)?;
            }
            2 => em.xchg_rr(reg, reg)?,
            3 => em.mov_rr(reg, reg)?,
            4 => em.lea(reg, reg, 0)?,
            5 => em.raw(&MULTI_BYTE_NOP)?,
            6 => em.test_rr(reg, reg)?,
            _ => em.cmp_ri8(reg, 0)?,
        }
    }

    Ok(count)
}
