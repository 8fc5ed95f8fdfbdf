//! Instruction-level obfuscation.
//!
//! Each decoded instruction that does not carry a fixup may be surrounded by
//! junk and replaced by an equivalent sequence. Categories are tried in
//! priority order and the first one that fires wins:
//!
//! 1. MBA rewriting of register-register `add`/`sub`/`xor`/`and`/`or` and
//!    register-immediate `add`
//! 2. Peephole substitution (`xor r,r`, `mov r,0`, `inc`, `dec`, `sub r,imm`)
//! 3. Constant encoding of `mov r,imm` and splitting of `add r,imm`
//!
//! Every random choice comes from one seedable generator owned by the
//! [`Obfuscator`], so a fixed seed reproduces a build exactly.

use crate::emit::{is_gpr32_or_64, is_stack_register, is_wide, AluOp, Emitter};
use crate::error::Result;
use crate::flags::FlagLiveness;
use crate::function::{Diagnostic, Function};
use crate::junk;
use crate::mba;
use crate::stream::{self, Site, StreamBuilder};

use iced_x86::{Instruction, Mnemonic, OpKind, Register};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Stage name used in diagnostics and errors.
pub const STAGE: &str = "obfuscate";

/// Obfuscation knobs.
#[derive(Clone, Debug)]
pub struct ObfuscatorSettings {
    pub junk_insertion: bool,
    pub instruction_substitution: bool,
    pub constant_encoding: bool,
    pub mba_obfuscation: bool,
    /// Nesting of MBA identities, clamped to `1..=3`.
    pub mba_depth: u32,
    /// Junk goes before an instruction with odds 1 in N.
    pub junk_before_odds: u32,
    /// Junk goes after an instruction with odds 1 in N.
    pub junk_after_odds: u32,
}

impl Default for ObfuscatorSettings {
    fn default() -> Self {
        Self {
            junk_insertion: true,
            instruction_substitution: true,
            constant_encoding: true,
            mba_obfuscation: false,
            mba_depth: 1,
            junk_before_odds: 3,
            junk_after_odds: 4,
        }
    }
}

impl ObfuscatorSettings {
    /// Every transform off; output equals input.
    pub fn disabled() -> Self {
        Self {
            junk_insertion: false,
            instruction_substitution: false,
            constant_encoding: false,
            mba_obfuscation: false,
            ..Self::default()
        }
    }

    fn depth(&self) -> u32 {
        self.mba_depth.clamp(1, mba::MAX_DEPTH)
    }
}

/// Statistics from obfuscating one function.
#[derive(Default, Debug, Clone)]
pub struct ObfuscationStats {
    pub instructions: usize,
    /// Copied verbatim because they carry a fixup.
    pub pinned: usize,
    pub junk_instructions: usize,
    pub substitutions: usize,
    pub constants_encoded: usize,
    pub mba_rewrites: usize,
    pub branches_relocated: usize,
    pub input_len: usize,
    pub output_len: usize,
}

impl ObfuscationStats {
    /// Instructions replaced by any category.
    pub fn rewritten(&self) -> usize {
        self.substitutions + self.constants_encoded + self.mba_rewrites
    }
}

/// Which category produced a replacement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Category {
    Mba,
    Substitution,
    Constant,
}

// ============================================================================
// Operand Patterns
// ============================================================================

/// `op r, r` on 32- or 64-bit registers of the same width.
fn reg_reg(instr: &Instruction) -> Option<(Register, Register)> {
    if instr.op_count() != 2
        || instr.op0_kind() != OpKind::Register
        || instr.op1_kind() != OpKind::Register
    {
        return None;
    }
    let (dst, src) = (instr.op0_register(), instr.op1_register());
    (is_gpr32_or_64(dst) && is_wide(dst) == is_wide(src) && is_gpr32_or_64(src)).then_some((dst, src))
}

/// `op r, imm` on a 32- or 64-bit register; the immediate as it would
/// appear in the low 32 bits (sign-extended for 64-bit registers).
fn reg_imm32(instr: &Instruction) -> Option<(Register, i32)> {
    if instr.op_count() != 2 || instr.op0_kind() != OpKind::Register {
        return None;
    }
    let dst = instr.op0_register();
    if !is_gpr32_or_64(dst) {
        return None;
    }
    match instr.op1_kind() {
        OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32
        | OpKind::Immediate32to64 => Some((dst, instr.immediate(1) as u32 as i32)),
        _ => None,
    }
}

/// `mov r, imm` with the full value loaded into the register.
fn mov_imm(instr: &Instruction) -> Option<(Register, u64)> {
    if instr.mnemonic() != Mnemonic::Mov || instr.op_count() != 2 {
        return None;
    }
    if instr.op0_kind() != OpKind::Register {
        return None;
    }
    let dst = instr.op0_register();
    if !is_gpr32_or_64(dst) {
        return None;
    }
    match instr.op1_kind() {
        OpKind::Immediate32 => Some((dst, instr.immediate(1) as u32 as u64)),
        OpKind::Immediate32to64 | OpKind::Immediate64 => Some((dst, instr.immediate(1))),
        _ => None,
    }
}

/// Single register operand of `inc`/`dec`.
fn single_reg(instr: &Instruction) -> Option<Register> {
    if instr.op_count() != 1 || instr.op0_kind() != OpKind::Register {
        return None;
    }
    let reg = instr.op0_register();
    is_gpr32_or_64(reg).then_some(reg)
}

fn alu_op(mnemonic: Mnemonic) -> Option<AluOp> {
    match mnemonic {
        Mnemonic::Add => Some(AluOp::Add),
        Mnemonic::Sub => Some(AluOp::Sub),
        Mnemonic::Xor => Some(AluOp::Xor),
        Mnemonic::And => Some(AluOp::And),
        Mnemonic::Or => Some(AluOp::Or),
        _ => None,
    }
}

/// Whether `value` fits a sign-extended 32-bit immediate at `dst`'s width.
fn as_imm32(dst: Register, value: u64) -> Option<i32> {
    if is_wide(dst) {
        i32::try_from(value as i64).ok()
    } else {
        Some(value as u32 as i32)
    }
}

// ============================================================================
// Obfuscator
// ============================================================================

/// Rewrites function code according to [`ObfuscatorSettings`].
pub struct Obfuscator {
    settings: ObfuscatorSettings,
    rng: StdRng,
}

impl Obfuscator {
    /// Obfuscator seeded from the operating system.
    pub fn new(settings: ObfuscatorSettings) -> Self {
        Self {
            settings,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Obfuscator with a fixed seed, for reproducible output.
    pub fn with_seed(settings: ObfuscatorSettings, seed: u64) -> Self {
        Self {
            settings,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reseed the generator.
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn settings(&self) -> &ObfuscatorSettings {
        &self.settings
    }

    /// Obfuscate `function` in place, carrying every fixup to its new
    /// offset.
    pub fn process(
        &mut self,
        function: &mut Function,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<ObfuscationStats> {
        let decoded = stream::decode_stream(&function.bytes);
        let liveness = FlagLiveness::analyze(&decoded.instructions);
        let mut stats = ObfuscationStats::default();

        let summary = stream::rewrite(function, &decoded, STAGE, diagnostics, |builder, site| {
            self.visit(builder, site, &liveness, &mut stats)
        })?;

        stats.instructions = summary.instructions;
        stats.pinned = summary.pinned;
        stats.branches_relocated = summary.relocated;
        stats.input_len = summary.input_len;
        stats.output_len = summary.output_len;

        tracing::debug!(
            "{}: {} -> {} bytes, {} rewritten, {} junk, {} pinned",
            function.qualified_name(),
            stats.input_len,
            stats.output_len,
            stats.rewritten(),
            stats.junk_instructions,
            stats.pinned
        );
        Ok(stats)
    }

    fn visit(
        &mut self,
        builder: &mut StreamBuilder,
        site: &Site<'_>,
        liveness: &FlagLiveness,
        stats: &mut ObfuscationStats,
    ) -> Result<()> {
        if self.settings.junk_insertion && self.roll(self.settings.junk_before_odds) {
            let dead = !liveness.live_before(site.index);
            let mut em = Emitter::new()?;
            stats.junk_instructions += junk::emit_junk(&mut em, &mut self.rng, dead)?;
            builder.push_bytes(em.finish()?);
        }

        let flags_dead = !liveness.live_after(site.index);
        match self.substitute(site.instr, flags_dead)? {
            Some((category, bytes)) => {
                match category {
                    Category::Mba => stats.mba_rewrites += 1,
                    Category::Substitution => stats.substitutions += 1,
                    Category::Constant => stats.constants_encoded += 1,
                }
                builder.push_bytes(bytes);
            }
            None => {
                builder.push_instruction(site.instr, site.bytes);
            }
        }

        if self.settings.junk_insertion && self.roll(self.settings.junk_after_odds) {
            let dead = !liveness.live_after(site.index);
            let mut em = Emitter::new()?;
            stats.junk_instructions += junk::emit_junk(&mut em, &mut self.rng, dead)?;
            builder.push_bytes(em.finish()?);
        }

        Ok(())
    }

    /// 1 in `odds`.
    fn roll(&mut self, odds: u32) -> bool {
        odds <= 1 || self.rng.random_range(0..odds) == 0
    }

    /// Try each enabled category in priority order.
    fn substitute(
        &mut self,
        instr: &Instruction,
        flags_dead: bool,
    ) -> Result<Option<(Category, Vec<u8>)>> {
        let mut em = Emitter::new()?;

        if self.settings.mba_obfuscation && flags_dead && self.try_mba(&mut em, instr)? {
            return Ok(Some((Category::Mba, em.finish()?)));
        }
        if self.settings.instruction_substitution && self.try_substitution(&mut em, instr, flags_dead)? {
            return Ok(Some((Category::Substitution, em.finish()?)));
        }
        if self.settings.constant_encoding && flags_dead && self.try_constant(&mut em, instr)? {
            return Ok(Some((Category::Constant, em.finish()?)));
        }
        Ok(None)
    }

    fn try_mba(&mut self, em: &mut Emitter, instr: &Instruction) -> Result<bool> {
        let Some(op) = alu_op(instr.mnemonic()) else {
            return Ok(false);
        };
        let depth = self.settings.depth();

        if let Some((dst, src)) = reg_reg(instr) {
            if !mba::eligible(op, dst, src) || !self.rng.random_bool(0.5) {
                return Ok(false);
            }
            return mba::emit_rr(em, &mut self.rng, op, dst, src, depth);
        }

        if op == AluOp::Add {
            if let Some((dst, imm)) = reg_imm32(instr) {
                if imm == 0 || is_stack_register(dst) || !self.roll(3) {
                    return Ok(false);
                }
                return mba::emit_add_imm(em, &mut self.rng, dst, imm, depth);
            }
        }
        Ok(false)
    }

    fn try_substitution(
        &mut self,
        em: &mut Emitter,
        instr: &Instruction,
        flags_dead: bool,
    ) -> Result<bool> {
        match instr.mnemonic() {
            // xor r,r and sub r,r leave identical flags
            Mnemonic::Xor => {
                let Some((dst, src)) = reg_reg(instr) else {
                    return Ok(false);
                };
                if dst != src || !self.rng.random_bool(0.5) {
                    return Ok(false);
                }
                em.alu_rr(AluOp::Sub, dst, dst)?;
                Ok(true)
            }
            Mnemonic::Mov if flags_dead => {
                let Some((dst, 0)) = mov_imm(instr) else {
                    return Ok(false);
                };
                let op = if self.rng.random_bool(0.5) {
                    AluOp::Xor
                } else {
                    AluOp::Sub
                };
                em.alu_rr(op, dst, dst)?;
                Ok(true)
            }
            Mnemonic::Inc | Mnemonic::Dec if flags_dead => {
                let Some(reg) = single_reg(instr) else {
                    return Ok(false);
                };
                if !self.rng.random_bool(0.5) {
                    return Ok(false);
                }
                let op = if instr.mnemonic() == Mnemonic::Inc {
                    AluOp::Add
                } else {
                    AluOp::Sub
                };
                em.alu_ri(op, reg, 1)?;
                Ok(true)
            }
            Mnemonic::Sub if flags_dead => {
                let Some((dst, imm)) = reg_imm32(instr) else {
                    return Ok(false);
                };
                // -i32::MIN has no imm32 encoding
                if imm == i32::MIN || !self.rng.random_bool(0.5) {
                    return Ok(false);
                }
                em.alu_ri(AluOp::Add, dst, imm.wrapping_neg())?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn try_constant(&mut self, em: &mut Emitter, instr: &Instruction) -> Result<bool> {
        if let Some((dst, value)) = mov_imm(instr) {
            if value == 0 || !self.roll(3) {
                return Ok(false);
            }
            return self.encode_constant(em, dst, value);
        }

        if instr.mnemonic() == Mnemonic::Add {
            if let Some((dst, imm)) = reg_imm32(instr) {
                if imm == 0 || !self.rng.random_bool(0.5) {
                    return Ok(false);
                }
                let (first, second) = self.split_addend(imm);
                em.alu_ri(AluOp::Add, dst, first)?;
                em.alu_ri(AluOp::Add, dst, second)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Materialize `value` in `dst` through one of three encodings.
    fn encode_constant(&mut self, em: &mut Emitter, dst: Register, value: u64) -> Result<bool> {
        let variant = self.rng.random_range(0..3);

        if variant == 0 {
            if let Some(c) = as_imm32(dst, value) {
                if mba::emit_constant(em, &mut self.rng, dst, c)? {
                    return Ok(true);
                }
            }
        }

        let key: i32 = self.rng.random();
        // Sign-extended at 64 bits, truncated at 32
        let key_value = if is_wide(dst) {
            key as i64 as u64
        } else {
            key as u32 as u64
        };

        if variant == 2 {
            em.mov_ri(dst, value.wrapping_sub(key_value))?;
            em.alu_ri(AluOp::Add, dst, key)?;
        } else {
            em.mov_ri(dst, value ^ key_value)?;
            em.alu_ri(AluOp::Xor, dst, key)?;
        }
        Ok(true)
    }

    /// Two imm32 values summing to `imm`.
    fn split_addend(&mut self, imm: i32) -> (i32, i32) {
        let first: i32 = self.rng.random_range(-0x4000_0000..0x4000_0000);
        match i32::try_from(imm as i64 - first as i64) {
            Ok(second) => (first, second),
            Err(_) => (imm / 2, imm - imm / 2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{Variable, VariableWidth};
    use crate::symbols::FunctionMetadata;
    use crate::stream::decode_stream;

    use iced_x86::{Decoder, DecoderOptions};
    use std::collections::HashMap;

    fn function(bytes: Vec<u8>) -> Function {
        let len = bytes.len();
        Function {
            group: "Test".into(),
            name: "obf".into(),
            bytes,
            variables: Vec::new(),
            dynamic_imports: Vec::new(),
            metadata: FunctionMetadata::new("Test:__CODE__obf", 0x1000, len),
        }
    }

    /// A small function exercising every category.
    fn sample_code() -> Vec<u8> {
        vec![
            0x31, 0xC0, // xor eax, eax
            0xB9, 0x0A, 0x00, 0x00, 0x00, // mov ecx, 10
            0x48, 0x01, 0xD8, // add rax, rbx
            0x48, 0x29, 0xD0, // sub rax, rdx
            0x48, 0x31, 0xC8, // xor rax, rcx
            0x21, 0xD1, // and ecx, edx
            0x09, 0xCA, // or edx, ecx
            0x48, 0x83, 0xC0, 0x10, // add rax, 0x10
            0x48, 0x83, 0xEB, 0x08, // sub rbx, 8
            0xFF, 0xC2, // inc edx
            0xFF, 0xC9, // dec ecx
            0x75, 0xE0, // jnz back to offset 2
            0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // mov rax, imm64
            0xC3, // ret
        ]
    }

    fn all_enabled() -> ObfuscatorSettings {
        ObfuscatorSettings {
            mba_obfuscation: true,
            mba_depth: 2,
            junk_before_odds: 1,
            junk_after_odds: 2,
            ..ObfuscatorSettings::default()
        }
    }

    #[test]
    fn test_disabled_is_identity() {
        let code = sample_code();
        let mut f = function(code.clone());
        let mut obf = Obfuscator::with_seed(ObfuscatorSettings::disabled(), 1);
        let mut diags = Vec::new();
        let stats = obf.process(&mut f, &mut diags).unwrap();
        assert_eq!(f.bytes, code);
        assert_eq!(stats.rewritten(), 0);
        assert_eq!(stats.branches_relocated, 0);
        assert!(diags.is_empty());
    }

    #[test]
    fn test_output_redecodes() {
        for seed in 0..32 {
            let mut f = function(sample_code());
            let mut obf = Obfuscator::with_seed(all_enabled(), seed);
            let mut diags = Vec::new();
            obf.process(&mut f, &mut diags).unwrap();

            let decoded = decode_stream(&f.bytes);
            assert!(decoded.truncated_at.is_none(), "seed {seed}");
            assert!(f.bytes.len() > sample_code().len());
            assert!(diags.is_empty());
        }
    }

    #[test]
    fn test_seed_reproducible() {
        let run = |seed| {
            let mut f = function(sample_code());
            let mut obf = Obfuscator::with_seed(all_enabled(), seed);
            obf.process(&mut f, &mut Vec::new()).unwrap();
            f.bytes
        };
        assert_eq!(run(7), run(7));
        assert_ne!(run(7), run(8));
    }

    #[test]
    fn test_set_seed_matches_with_seed() {
        let mut a = function(sample_code());
        let mut b = function(sample_code());
        let mut obf = Obfuscator::new(all_enabled());
        obf.set_seed(99);
        obf.process(&mut a, &mut Vec::new()).unwrap();
        Obfuscator::with_seed(all_enabled(), 99)
            .process(&mut b, &mut Vec::new())
            .unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn test_fixups_pinned_and_remapped() {
        // mov eax, <slot>; add eax, ecx; mov edx, <slot>; ret
        let code = vec![
            0xB8, 0x00, 0x00, 0x00, 0x00, 0x01, 0xC8, 0xBA, 0x00, 0x00, 0x00, 0x00, 0xC3,
        ];
        for seed in 0..16 {
            let mut f = function(code.clone());
            f.variables = vec![
                Variable {
                    width: VariableWidth::Dword,
                    offset: 1,
                    slot: 1,
                },
                Variable {
                    width: VariableWidth::Dword,
                    offset: 8,
                    slot: 2,
                },
            ];
            let mut obf = Obfuscator::with_seed(all_enabled(), seed);
            let stats = obf.process(&mut f, &mut Vec::new()).unwrap();

            assert_eq!(stats.pinned, 2);
            assert_eq!(f.variables.len(), 2);
            for var in &f.variables {
                let at = var.offset as usize;
                assert!(at + 4 <= f.bytes.len());
                assert_eq!(&f.bytes[at..at + 4], &[0; 4]);
            }
            assert_eq!(f.bytes[f.variables[0].offset as usize - 1], 0xB8);
            assert_eq!(f.bytes[f.variables[1].offset as usize - 1], 0xBA);
        }
    }

    #[test]
    fn test_mba_never_touches_stack_registers() {
        // add rsp, rax; sub rbp, rcx; add rsp, 0x20; xor rbp, rdx; ret
        let code = vec![
            0x48, 0x01, 0xC4, 0x48, 0x29, 0xCD, 0x48, 0x83, 0xC4, 0x20, 0x48, 0x31, 0xD5, 0xC3,
        ];
        let settings = ObfuscatorSettings {
            mba_obfuscation: true,
            ..ObfuscatorSettings::disabled()
        };
        for seed in 0..32 {
            let mut f = function(code.clone());
            let mut obf = Obfuscator::with_seed(settings.clone(), seed);
            let stats = obf.process(&mut f, &mut Vec::new()).unwrap();
            assert_eq!(stats.mba_rewrites, 0);
            assert_eq!(f.bytes, code);
        }
    }

    #[test]
    fn test_live_flags_block_rewrites() {
        // add eax, ecx; jz +0; ret -- the add's flags feed the jz
        let code = vec![0x01, 0xC8, 0x74, 0x00, 0xC3];
        let settings = ObfuscatorSettings {
            mba_obfuscation: true,
            junk_insertion: false,
            ..ObfuscatorSettings::default()
        };
        for seed in 0..32 {
            let mut f = function(code.clone());
            let mut obf = Obfuscator::with_seed(settings.clone(), seed);
            obf.process(&mut f, &mut Vec::new()).unwrap();
            assert_eq!(f.bytes, code);
        }
    }

    #[test]
    fn test_sub_min_imm_untouched() {
        // sub eax, 0x80000000; ret
        let code = vec![0x2D, 0x00, 0x00, 0x00, 0x80, 0xC3];
        let settings = ObfuscatorSettings {
            instruction_substitution: true,
            ..ObfuscatorSettings::disabled()
        };
        for seed in 0..32 {
            let mut f = function(code.clone());
            Obfuscator::with_seed(settings.clone(), seed)
                .process(&mut f, &mut Vec::new())
                .unwrap();
            assert_eq!(f.bytes, code);
        }
    }

    #[test]
    fn test_depth_clamped() {
        let settings = ObfuscatorSettings {
            mba_depth: 10,
            ..ObfuscatorSettings::default()
        };
        assert_eq!(settings.depth(), mba::MAX_DEPTH);
        let settings = ObfuscatorSettings {
            mba_depth: 0,
            ..ObfuscatorSettings::default()
        };
        assert_eq!(settings.depth(), 1);
    }

    // ------------------------------------------------------------------
    // Register-level interpreter
    // ------------------------------------------------------------------

    const STACK_TOP: u64 = 0x7FFF_F000;
    const STEP_LIMIT: usize = 100_000;

    /// General purpose registers plus the zero flag, the only flag the
    /// programs below branch on.
    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Machine {
        regs: [u64; 16],
        zf: bool,
    }

    impl Machine {
        fn random(rng: &mut StdRng) -> Self {
            let mut regs: [u64; 16] = rng.random();
            regs[Register::RSP.number()] = STACK_TOP;
            Self { regs, zf: false }
        }

        fn get(&self, reg: Register) -> u64 {
            assert!(is_gpr32_or_64(reg), "unsupported register {:?}", reg);
            truncate(reg, self.regs[reg.full_register().number()])
        }

        /// 32-bit writes zero the upper half.
        fn set(&mut self, reg: Register, value: u64) {
            assert!(is_gpr32_or_64(reg), "unsupported register {:?}", reg);
            self.regs[reg.full_register().number()] = truncate(reg, value);
        }

        fn operand(&self, instr: &Instruction, n: u32) -> u64 {
            match instr.op_kind(n) {
                OpKind::Register => self.get(instr.op_register(n)),
                OpKind::Immediate8
                | OpKind::Immediate32
                | OpKind::Immediate64
                | OpKind::Immediate8to32
                | OpKind::Immediate8to64
                | OpKind::Immediate32to64 => instr.immediate(n),
                kind => panic!("unsupported operand {:?} in {}", kind, instr),
            }
        }

        fn rsp(&mut self) -> &mut u64 {
            &mut self.regs[Register::RSP.number()]
        }

        /// Execute from offset 0 until `ret`.
        fn run(mut self, code: &[u8]) -> Self {
            let mut stack: HashMap<u64, u64> = HashMap::new();
            let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
            let mut instr = Instruction::default();
            let mut ip = 0u64;

            for _ in 0..STEP_LIMIT {
                decoder.set_position(ip as usize).unwrap();
                decoder.set_ip(ip);
                decoder.decode_out(&mut instr);
                assert!(!instr.is_invalid(), "invalid instruction at {:#x}", ip);
                let mut next = instr.next_ip();

                match instr.mnemonic() {
                    Mnemonic::Ret => return self,
                    Mnemonic::Nop => {}
                    Mnemonic::Mov => {
                        let value = self.operand(&instr, 1);
                        self.set(instr.op0_register(), value);
                    }
                    Mnemonic::Add | Mnemonic::Sub | Mnemonic::Xor | Mnemonic::And | Mnemonic::Or => {
                        let op = alu_op(instr.mnemonic()).unwrap();
                        let dst = instr.op0_register();
                        let value = op.apply(self.get(dst), self.operand(&instr, 1));
                        self.set(dst, value);
                        self.zf = self.get(dst) == 0;
                    }
                    Mnemonic::Not => {
                        let dst = instr.op0_register();
                        self.set(dst, !self.get(dst));
                    }
                    Mnemonic::Inc | Mnemonic::Dec => {
                        let dst = instr.op0_register();
                        let value = if instr.mnemonic() == Mnemonic::Inc {
                            self.get(dst).wrapping_add(1)
                        } else {
                            self.get(dst).wrapping_sub(1)
                        };
                        self.set(dst, value);
                        self.zf = self.get(dst) == 0;
                    }
                    Mnemonic::Test => {
                        let a = self.get(instr.op0_register());
                        self.zf = a & self.operand(&instr, 1) == 0;
                    }
                    Mnemonic::Cmp => {
                        let a = instr.op0_register();
                        self.zf = self.get(a) == truncate(a, self.operand(&instr, 1));
                    }
                    Mnemonic::Push => {
                        let value = self.get(instr.op0_register());
                        *self.rsp() -= 8;
                        stack.insert(*self.rsp(), value);
                    }
                    Mnemonic::Pop => {
                        let at = *self.rsp();
                        let value = stack.remove(&at).expect("pop from empty stack");
                        *self.rsp() += 8;
                        self.set(instr.op0_register(), value);
                    }
                    Mnemonic::Xchg => {
                        let (a, b) = (instr.op0_register(), instr.op1_register());
                        let (va, vb) = (self.get(a), self.get(b));
                        self.set(a, vb);
                        self.set(b, va);
                    }
                    Mnemonic::Lea => {
                        let mut addr = instr.memory_displacement64();
                        if instr.memory_base() != Register::None {
                            addr = addr.wrapping_add(self.get(instr.memory_base()));
                        }
                        if instr.memory_index() != Register::None {
                            let index = self.get(instr.memory_index());
                            addr = addr.wrapping_add(index.wrapping_mul(instr.memory_index_scale() as u64));
                        }
                        self.set(instr.op0_register(), addr);
                    }
                    Mnemonic::Je if self.zf => next = instr.near_branch_target(),
                    Mnemonic::Jne if !self.zf => next = instr.near_branch_target(),
                    Mnemonic::Je | Mnemonic::Jne => {}
                    _ => panic!("unsupported instruction {} at {:#x}", instr, ip),
                }
                ip = next;
            }
            panic!("no ret within {} steps", STEP_LIMIT);
        }
    }

    fn truncate(reg: Register, value: u64) -> u64 {
        if is_wide(reg) {
            value
        } else {
            value & 0xFFFF_FFFF
        }
    }

    /// Mixed-width arithmetic over every category's operands, scratch
    /// registers and the frame pointer included, around a counted loop.
    fn arithmetic_code() -> Vec<u8> {
        use iced_x86::code_asm::*;

        let mut a = CodeAssembler::new(64).unwrap();
        let mut top = a.create_label();
        a.mov(rax, 0x1122_3344_5566_7788u64).unwrap();
        a.mov(ecx, 5).unwrap();
        a.mov(r10, 0x0BAD_F00Di64).unwrap();
        a.xor(r11d, r11d).unwrap();
        a.set_label(&mut top).unwrap();
        a.add(rax, rbx).unwrap();
        a.sub(rdx, rsi).unwrap();
        a.xor(r11, rax).unwrap();
        a.and(edi, edx).unwrap();
        a.or(r12, rcx).unwrap();
        a.add(ebp, 0x1234).unwrap();
        a.sub(r13d, 0x77).unwrap();
        a.xor(rbp, rdi).unwrap();
        a.add(r10d, ebx).unwrap();
        a.inc(rsi).unwrap();
        a.sub(rbx, -8).unwrap();
        a.not(r8).unwrap();
        a.lea(r9, ptr(rax + 0x40)).unwrap();
        a.mov(edx, 0).unwrap();
        a.add(rsi, rdx).unwrap();
        a.or(r13d, r8d).unwrap();
        a.and(r12, 0x7FFF_FF00).unwrap();
        a.sub(r10, r11).unwrap();
        a.dec(ecx).unwrap();
        a.jne(top).unwrap();
        a.mov(r14, -2i64).unwrap();
        a.and(r14, r15).unwrap();
        a.add(r15d, -0x1000).unwrap();
        a.xor(eax, eax).unwrap();
        a.add(rax, r14).unwrap();
        a.or(eax, 0x10).unwrap();
        a.sub(rbp, rax).unwrap();
        a.dec(r9d).unwrap();
        a.ret().unwrap();
        a.assemble(0).unwrap()
    }

    #[test]
    fn test_interpreter_runs_plain_code() {
        let mut machine = Machine::random(&mut StdRng::seed_from_u64(0));
        machine.regs[Register::RBX.number()] = 3;
        let done = machine.clone().run(&arithmetic_code());
        assert_eq!(done.regs[Register::RSP.number()], STACK_TOP);
        assert_eq!(done.get(Register::ECX), 0);
        assert_eq!(done.get(Register::RBX), 3 + 5 * 8);
        assert_eq!(done.get(Register::EDX), 0);
    }

    #[test]
    fn test_obfuscation_preserves_registers() {
        let code = arithmetic_code();
        let mut states = StdRng::seed_from_u64(0xC0FFEE);

        for seed in 0..300 {
            let settings = ObfuscatorSettings {
                mba_obfuscation: true,
                mba_depth: 1 + (seed % 3) as u32,
                junk_before_odds: 2,
                junk_after_odds: 2,
                ..ObfuscatorSettings::default()
            };
            let mut f = function(code.clone());
            let stats = Obfuscator::with_seed(settings, seed)
                .process(&mut f, &mut Vec::new())
                .unwrap();
            assert!(stats.rewritten() > 0, "seed {seed}");

            for _ in 0..3 {
                let start = Machine::random(&mut states);
                let expected = start.clone().run(&code);
                let actual = start.run(&f.bytes);
                assert_eq!(actual.regs, expected.regs, "seed {seed}");
                assert_eq!(actual.regs[Register::RSP.number()], STACK_TOP, "seed {seed}");
            }
        }
    }

    #[test]
    fn test_split_addend() {
        let mut obf = Obfuscator::with_seed(ObfuscatorSettings::default(), 5);
        for imm in [1, -1, i32::MAX, i32::MIN, 0x10, -0x7FFF_0000] {
            let (a, b) = obf.split_addend(imm);
            assert_eq!(a as i64 + b as i64, imm as i64);
        }
    }
}
