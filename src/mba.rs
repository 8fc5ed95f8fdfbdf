//! Mixed boolean-arithmetic rewriting.
//!
//! Each supported operation is replaced by an identity that computes the
//! same value through a different mix of arithmetic and bitwise steps:
//!
//! ```text
//! a + b = (a ^ b) + 2(a & b)
//! a - b = (a ^ b) - 2(~a & b)
//! a ^ b = (a | b) - (a & b)
//! a & b = (a + b) - (a | b)
//! a | b = (a + b) - (a & b)
//! ```
//!
//! All hold modulo 2^n, so the same sequences serve 32- and 64-bit
//! operands. Intermediates live in scratch registers saved with push/pop,
//! which is why the stack and frame pointers are never rewritten.

use crate::emit::{is_stack_register, pick_scratch, AluOp, Emitter};
use crate::error::Result;

use iced_x86::Register;
use rand::rngs::StdRng;
use rand::Rng;

/// Upper bound for `mba_depth`.
pub const MAX_DEPTH: u32 = 3;

// ============================================================================
// Identities
// ============================================================================

/// Split `c` into `(hi, lo)` with `hi - lo == c`, using `key` as a mask.
///
/// `hi = c | key` and `lo = ~c & key`; `lo` only has bits that are set in
/// `hi`, so the subtraction never borrows. When `c` and `key` are both
/// sign-extended 32-bit values, so are both parts.
pub fn constant_split(c: u64, key: u64) -> (u64, u64) {
    (c | key, !c & key)
}

/// Whether `dst op src` may be rewritten.
pub fn eligible(op: AluOp, dst: Register, src: Register) -> bool {
    if is_stack_register(dst) || is_stack_register(src) {
        return false;
    }
    // sub/xor of a register with itself is a zeroing idiom
    !(matches!(op, AluOp::Sub | AluOp::Xor) && dst == src)
}

// ============================================================================
// Emission
// ============================================================================

/// Emit `dst = dst op src` through its identity.
///
/// With `depth > 1` the combining step of the identity is itself rewritten.
/// Returns `false` without emitting anything if no scratch registers are
/// free.
pub fn emit_rr(
    em: &mut Emitter,
    rng: &mut StdRng,
    op: AluOp,
    dst: Register,
    src: Register,
    depth: u32,
) -> Result<bool> {
    let Some(scratch) = pick_scratch(rng, 2, &[dst, src]) else {
        return Ok(false);
    };
    let (s1, s2) = (scratch[0], scratch[1]);
    let (t1, t2) = (s1.sized(dst), s2.sized(dst));

    em.push(s1.r64)?;
    em.push(s2.r64)?;

    let combine = match op {
        AluOp::Add => {
            em.mov_rr(t1, dst)?;
            em.alu_rr(AluOp::Xor, t1, src)?;
            em.mov_rr(t2, dst)?;
            em.alu_rr(AluOp::And, t2, src)?;
            em.alu_rr(AluOp::Add, t2, t2)?;
            AluOp::Add
        }
        AluOp::Sub => {
            em.mov_rr(t1, dst)?;
            em.alu_rr(AluOp::Xor, t1, src)?;
            em.mov_rr(t2, dst)?;
            em.not(t2)?;
            em.alu_rr(AluOp::And, t2, src)?;
            em.alu_rr(AluOp::Add, t2, t2)?;
            AluOp::Sub
        }
        AluOp::Xor => {
            em.mov_rr(t1, dst)?;
            em.alu_rr(AluOp::Or, t1, src)?;
            em.mov_rr(t2, dst)?;
            em.alu_rr(AluOp::And, t2, src)?;
            AluOp::Sub
        }
        AluOp::And | AluOp::Or => {
            em.mov_rr(t1, dst)?;
            em.alu_rr(AluOp::Add, t1, src)?;
            em.mov_rr(t2, dst)?;
            let mask = if op == AluOp::And {
                AluOp::Or
            } else {
                AluOp::And
            };
            em.alu_rr(mask, t2, src)?;
            AluOp::Sub
        }
    };

    if depth <= 1 || !emit_rr(em, rng, combine, t1, t2, depth - 1)? {
        em.alu_rr(combine, t1, t2)?;
    }

    em.mov_rr(dst, t1)?;
    em.pop(s2.r64)?;
    em.pop(s1.r64)?;
    Ok(true)
}

/// Emit `dst = dst + imm`: the immediate is rebuilt in a scratch register
/// from two masked parts, then added through the add identity.
pub fn emit_add_imm(
    em: &mut Emitter,
    rng: &mut StdRng,
    dst: Register,
    imm: i32,
    depth: u32,
) -> Result<bool> {
    if is_stack_register(dst) {
        return Ok(false);
    }
    let Some(scratch) = pick_scratch(rng, 1, &[dst]) else {
        return Ok(false);
    };
    let s = scratch[0];
    let t = s.sized(dst);

    let key: i32 = rng.random();
    let (hi, lo) = constant_split(imm as i64 as u64, key as i64 as u64);

    em.push(s.r64)?;
    em.mov_ri(t, hi)?;
    em.alu_ri(AluOp::Sub, t, lo as i64 as i32)?;
    if !emit_rr(em, rng, AluOp::Add, dst, t, depth)? {
        em.alu_rr(AluOp::Add, dst, t)?;
    }
    em.pop(s.r64)?;
    Ok(true)
}

/// Emit `mov dst, c` as `mov dst, hi; mov t, lo; sub dst, t`.
///
/// `c` must be representable as a sign-extended 32-bit immediate at the
/// width of `dst`.
pub fn emit_constant(em: &mut Emitter, rng: &mut StdRng, dst: Register, c: i32) -> Result<bool> {
    if is_stack_register(dst) {
        return Ok(false);
    }
    let Some(scratch) = pick_scratch(rng, 1, &[dst]) else {
        return Ok(false);
    };
    let s = scratch[0];
    let t = s.sized(dst);

    let key: i32 = rng.random();
    let (hi, lo) = constant_split(c as i64 as u64, key as i64 as u64);

    em.mov_ri(dst, hi)?;
    em.push(s.r64)?;
    em.mov_ri(t, lo)?;
    em.alu_rr(AluOp::Sub, dst, t)?;
    em.pop(s.r64)?;
    Ok(true)
}
