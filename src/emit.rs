//! Instruction emission helpers.
//!
//! [`Emitter`] wraps a `CodeAssembler` and picks the right opcode form for
//! 32- and 64-bit register operands, so the transforms can be written in
//! terms of operations rather than encodings.

use crate::error::Result;

use iced_x86::code_asm::CodeAssembler;
use iced_x86::{Code, Instruction, MemoryOperand, Register};
use rand::rngs::StdRng;
use rand::Rng;

/// Two-operand ALU operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Xor,
    And,
    Or,
}

impl AluOp {
    fn rr_code(self, wide: bool) -> Code {
        match (self, wide) {
            (AluOp::Add, true) => Code::Add_rm64_r64,
            (AluOp::Add, false) => Code::Add_rm32_r32,
            (AluOp::Sub, true) => Code::Sub_rm64_r64,
            (AluOp::Sub, false) => Code::Sub_rm32_r32,
            (AluOp::Xor, true) => Code::Xor_rm64_r64,
            (AluOp::Xor, false) => Code::Xor_rm32_r32,
            (AluOp::And, true) => Code::And_rm64_r64,
            (AluOp::And, false) => Code::And_rm32_r32,
            (AluOp::Or, true) => Code::Or_rm64_r64,
            (AluOp::Or, false) => Code::Or_rm32_r32,
        }
    }

    fn ri_code(self, wide: bool) -> Code {
        match (self, wide) {
            (AluOp::Add, true) => Code::Add_rm64_imm32,
            (AluOp::Add, false) => Code::Add_rm32_imm32,
            (AluOp::Sub, true) => Code::Sub_rm64_imm32,
            (AluOp::Sub, false) => Code::Sub_rm32_imm32,
            (AluOp::Xor, true) => Code::Xor_rm64_imm32,
            (AluOp::Xor, false) => Code::Xor_rm32_imm32,
            (AluOp::And, true) => Code::And_rm64_imm32,
            (AluOp::And, false) => Code::And_rm32_imm32,
            (AluOp::Or, true) => Code::Or_rm64_imm32,
            (AluOp::Or, false) => Code::Or_rm32_imm32,
        }
    }

    /// Reference semantics at 64 bits.
    pub fn apply(self, a: u64, b: u64) -> u64 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::Xor => a ^ b,
            AluOp::And => a & b,
            AluOp::Or => a | b,
        }
    }
}

/// Whether `reg` is a 64-bit GPR. Everything else handled here is 32-bit.
pub fn is_wide(reg: Register) -> bool {
    reg.is_gpr64()
}

/// 32- or 64-bit general purpose register.
pub fn is_gpr32_or_64(reg: Register) -> bool {
    reg.is_gpr32() || reg.is_gpr64()
}

/// Stack or frame pointer, at any width.
pub fn is_stack_register(reg: Register) -> bool {
    matches!(reg.full_register(), Register::RSP | Register::RBP)
}

/// Assembles a short instruction sequence.
pub struct Emitter {
    asm: CodeAssembler,
    instructions: usize,
}

impl Emitter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            asm: CodeAssembler::new(64)?,
            instructions: 0,
        })
    }

    /// Number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.instructions
    }

    pub fn is_empty(&self) -> bool {
        self.instructions == 0
    }

    pub fn instruction(&mut self, instr: Instruction) -> Result<()> {
        self.asm.add_instruction(instr)?;
        self.instructions += 1;
        Ok(())
    }

    /// Emit pre-encoded bytes.
    pub fn raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.asm.db(bytes)?;
        self.instructions += 1;
        Ok(())
    }

    pub fn push(&mut self, reg64: Register) -> Result<()> {
        self.instruction(Instruction::with1(Code::Push_r64, reg64)?)
    }

    pub fn pop(&mut self, reg64: Register) -> Result<()> {
        self.instruction(Instruction::with1(Code::Pop_r64, reg64)?)
    }

    /// `mov dst, src` (same width).
    pub fn mov_rr(&mut self, dst: Register, src: Register) -> Result<()> {
        let code = if is_wide(dst) {
            Code::Mov_rm64_r64
        } else {
            Code::Mov_rm32_r32
        };
        self.instruction(Instruction::with2(code, dst, src)?)
    }

    /// `op dst, src` (same width).
    pub fn alu_rr(&mut self, op: AluOp, dst: Register, src: Register) -> Result<()> {
        self.instruction(Instruction::with2(op.rr_code(is_wide(dst)), dst, src)?)
    }

    /// `op dst, imm32`; sign-extended for 64-bit destinations.
    pub fn alu_ri(&mut self, op: AluOp, dst: Register, imm: i32) -> Result<()> {
        self.instruction(Instruction::with2(op.ri_code(is_wide(dst)), dst, imm)?)
    }

    pub fn not(&mut self, dst: Register) -> Result<()> {
        let code = if is_wide(dst) {
            Code::Not_rm64
        } else {
            Code::Not_rm32
        };
        self.instruction(Instruction::with1(code, dst)?)
    }

    /// Load `value` into `dst` with the shortest `mov` form.
    ///
    /// For 32-bit destinations only the low 32 bits of `value` are used.
    pub fn mov_ri(&mut self, dst: Register, value: u64) -> Result<()> {
        let instr = if !is_wide(dst) {
            Instruction::with2(Code::Mov_r32_imm32, dst, value as u32)?
        } else if let Ok(imm) = i32::try_from(value as i64) {
            Instruction::with2(Code::Mov_rm64_imm32, dst, imm)?
        } else {
            Instruction::with2(Code::Mov_r64_imm64, dst, value)?
        };
        self.instruction(instr)
    }

    /// `mov reg64, imm64` with a full 8-byte immediate at offset 2.
    pub fn mov_imm64(&mut self, dst: Register, value: u64) -> Result<()> {
        self.instruction(Instruction::with2(Code::Mov_r64_imm64, dst, value)?)
    }

    pub fn xchg_rr(&mut self, a: Register, b: Register) -> Result<()> {
        self.instruction(Instruction::with2(Code::Xchg_rm64_r64, a, b)?)
    }

    /// `lea dst, [base + displ]`.
    pub fn lea(&mut self, dst: Register, base: Register, displ: i64) -> Result<()> {
        let mem = MemoryOperand::with_base_displ(base, displ);
        self.instruction(Instruction::with2(Code::Lea_r64_m, dst, mem)?)
    }

    pub fn test_rr(&mut self, a: Register, b: Register) -> Result<()> {
        self.instruction(Instruction::with2(Code::Test_rm64_r64, a, b)?)
    }

    pub fn cmp_ri8(&mut self, a: Register, imm: i32) -> Result<()> {
        self.instruction(Instruction::with2(Code::Cmp_rm64_imm8, a, imm)?)
    }

    pub fn call_reg(&mut self, reg64: Register) -> Result<()> {
        self.instruction(Instruction::with1(Code::Call_rm64, reg64)?)
    }

    pub fn jmp_reg(&mut self, reg64: Register) -> Result<()> {
        self.instruction(Instruction::with1(Code::Jmp_rm64, reg64)?)
    }

    pub fn nop(&mut self) -> Result<()> {
        self.instruction(Instruction::with(Code::Nopd))
    }

    /// Assemble everything emitted so far.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        Ok(self.asm.assemble(0)?)
    }
}

// ============================================================================
// Scratch Registers
// ============================================================================

/// A scratch register at both widths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scratch {
    pub r64: Register,
    pub r32: Register,
}

impl Scratch {
    /// The register at the width of `like`.
    pub fn sized(self, like: Register) -> Register {
        if is_wide(like) {
            self.r64
        } else {
            self.r32
        }
    }
}

/// Interchangeable scratch registers, always saved and restored.
pub const SCRATCH_POOL: [Scratch; 4] = [
    Scratch {
        r64: Register::R10,
        r32: Register::R10D,
    },
    Scratch {
        r64: Register::R11,
        r32: Register::R11D,
    },
    Scratch {
        r64: Register::R12,
        r32: Register::R12D,
    },
    Scratch {
        r64: Register::R13,
        r32: Register::R13D,
    },
];

/// Pick `count` distinct scratch registers, none of which is (a sub-register
/// of) anything in `avoid`. Returns `None` if the pool runs dry.
pub fn pick_scratch(rng: &mut StdRng, count: usize, avoid: &[Register]) -> Option<Vec<Scratch>> {
    let mut free: Vec<Scratch> = SCRATCH_POOL
        .iter()
        .copied()
        .filter(|s| !avoid.iter().any(|r| r.full_register() == s.r64))
        .collect();

    let mut picked = Vec::with_capacity(count);
    for _ in 0..count {
        if free.is_empty() {
            return None;
        }
        let i = rng.random_range(0..free.len());
        picked.push(free.swap_remove(i));
    }
    Some(picked)
}

/// Any one scratch register.
pub fn any_scratch(rng: &mut StdRng) -> Scratch {
    SCRATCH_POOL[rng.random_range(0..SCRATCH_POOL.len())]
}
