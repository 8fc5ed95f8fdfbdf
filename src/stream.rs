//! Instruction stream decoding and re-assembly.
//!
//! Both rewriting stages decode a function, emit a new byte sequence per
//! instruction and then need three things put back together: the final
//! bytes, every relative branch and RIP-relative operand that points inside
//! the function re-targeted to the new layout, and every fixup moved to its
//! new offset. [`rewrite`] drives that loop; stages only decide what each
//! instruction turns into.
//!
//! Instruction pointers are function offsets: the decoder runs with an IP of
//! zero at the first byte.

use crate::error::{Error, Result};
use crate::fixup::{self, FixupMap, FixupRef};
use crate::function::{Diagnostic, DiagnosticKind, Function};

use iced_x86::{Decoder, DecoderOptions, Encoder, Instruction, OpKind};
use std::collections::HashMap;

// ============================================================================
// Decoding
// ============================================================================

/// A function decoded up to its first undecodable instruction.
#[derive(Clone, Debug)]
pub struct DecodedStream {
    /// Decoded instructions; `ip()` is the offset in the function.
    pub instructions: Vec<Instruction>,
    /// Offset of the first byte that did not decode, if any.
    pub truncated_at: Option<u32>,
    /// Length of the input.
    pub code_len: u32,
}

/// Decode `code` as 64-bit instructions.
pub fn decode_stream(code: &[u8]) -> DecodedStream {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut truncated_at = None;
    let mut instr = Instruction::default();

    while decoder.can_decode() {
        let offset = decoder.position() as u32;
        decoder.decode_out(&mut instr);
        if instr.is_invalid() {
            truncated_at = Some(offset);
            break;
        }
        instructions.push(instr);
    }

    DecodedStream {
        instructions,
        truncated_at,
        code_len: code.len() as u32,
    }
}

/// Target of a branch or RIP-relative memory operand, as a function offset.
pub fn relative_target(instr: &Instruction) -> Option<u64> {
    if instr.op0_kind() == OpKind::NearBranch64 {
        return Some(instr.near_branch_target());
    }
    if instr.is_ip_rel_memory_operand() {
        return Some(instr.ip_rel_memory_address());
    }
    None
}

// ============================================================================
// Stream Builder
// ============================================================================

/// An instruction whose encoding depends on where its target ends up.
#[derive(Clone, Debug)]
struct RelativePiece {
    instr: Instruction,
    original: Vec<u8>,
    /// Original target offset.
    target: u64,
    /// Piece index the target resolves to.
    target_piece: usize,
    /// Re-encoded at least once; never falls back to the original bytes.
    reencoded: bool,
    /// Promoted from a short to a near branch.
    promoted: bool,
    encoded: Vec<u8>,
}

impl RelativePiece {
    fn is_branch(&self) -> bool {
        self.instr.op0_kind() == OpKind::NearBranch64
    }

    fn encode(&mut self, ip: u64, target: u64) -> Result<()> {
        let old_ip = self.instr.ip();
        if !self.reencoded && target.wrapping_sub(ip) == self.target.wrapping_sub(old_ip) {
            self.encoded.clone_from(&self.original);
            return Ok(());
        }
        self.reencoded = true;

        let mut instr = self.instr;
        if self.is_branch() {
            instr.set_near_branch64(target);
        } else {
            instr.set_memory_displacement64(target);
        }
        if self.promoted {
            instr.as_near_branch();
        }

        let mut encoder = Encoder::new(64);
        match encoder.encode(&instr, ip) {
            Ok(_) => {
                self.encoded = encoder.take_buffer();
                Ok(())
            }
            Err(err) if self.is_branch() && !self.promoted => {
                let short_code = instr.code();
                instr.as_near_branch();
                if instr.code() == short_code {
                    // loop/jrcxz have no near form
                    return Err(Error::BranchOutOfRange {
                        offset: old_ip as u32,
                    });
                }
                tracing::debug!("promoting branch at +0x{:X} to near form ({})", old_ip, err);
                self.promoted = true;
                let mut encoder = Encoder::new(64);
                encoder.encode(&instr, ip)?;
                self.encoded = encoder.take_buffer();
                Ok(())
            }
            Err(_) if self.is_branch() => Err(Error::BranchOutOfRange {
                offset: old_ip as u32,
            }),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Clone, Debug)]
enum Piece {
    Bytes(Vec<u8>),
    Relative(RelativePiece),
}

impl Piece {
    fn len(&self) -> usize {
        match self {
            Piece::Bytes(bytes) => bytes.len(),
            Piece::Relative(rel) => rel.encoded.len(),
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Piece::Bytes(bytes) => bytes,
            Piece::Relative(rel) => &rel.encoded,
        }
    }
}

/// Output of [`StreamBuilder::finish`].
#[derive(Clone, Debug, Default)]
pub struct Assembled {
    pub bytes: Vec<u8>,
    /// Final offset of every mark, in the order the marks were made.
    pub marks: Vec<u32>,
    /// `(instruction offset, target)` of references left unrelocated.
    pub unmapped: Vec<(u32, u64)>,
    /// Number of references re-encoded against the new layout.
    pub relocated: usize,
}

/// Collects the rewritten pieces of a function.
#[derive(Clone, Debug)]
pub struct StreamBuilder {
    code_len: u32,
    pieces: Vec<Piece>,
    /// Original instruction offset -> first piece emitted for it.
    anchors: HashMap<u32, usize>,
    marks: Vec<(usize, u32)>,
}

impl StreamBuilder {
    pub fn new(code_len: u32) -> Self {
        Self {
            code_len,
            pieces: Vec::new(),
            anchors: HashMap::new(),
            marks: Vec::new(),
        }
    }

    /// Start emitting for the instruction at `offset`. Branches to that
    /// offset land on whatever is pushed next.
    pub fn begin_instruction(&mut self, offset: u32) {
        self.anchors.insert(offset, self.pieces.len());
    }

    /// Append fixed bytes and return the piece index.
    pub fn push_bytes(&mut self, bytes: Vec<u8>) -> usize {
        self.pieces.push(Piece::Bytes(bytes));
        self.pieces.len() - 1
    }

    /// Append an original instruction and return the piece index.
    ///
    /// Instructions that reference a location inside the function are
    /// re-targeted when the stream is finished.
    pub fn push_instruction(&mut self, instr: &Instruction, original: &[u8]) -> usize {
        match relative_target(instr) {
            Some(target) if target <= self.code_len as u64 => {
                self.pieces.push(Piece::Relative(RelativePiece {
                    instr: *instr,
                    original: original.to_vec(),
                    target,
                    target_piece: 0,
                    reencoded: false,
                    promoted: false,
                    encoded: original.to_vec(),
                }));
            }
            _ => self.pieces.push(Piece::Bytes(original.to_vec())),
        }
        self.pieces.len() - 1
    }

    /// Track the byte at `offset` within `piece`. Returns the mark index.
    pub fn mark(&mut self, piece: usize, offset: u32) -> usize {
        self.marks.push((piece, offset));
        self.marks.len() - 1
    }

    /// Lay the stream out and resolve every relative reference and mark.
    ///
    /// `end` is the original offset that maps to the end of the new stream,
    /// when the whole input was decoded.
    pub fn finish(mut self, end: Option<u32>) -> Result<Assembled> {
        if let Some(end) = end {
            self.anchors.insert(end, self.pieces.len());
        }

        let mut unmapped = Vec::new();
        for piece in &mut self.pieces {
            let Piece::Relative(rel) = piece else {
                continue;
            };
            let anchor = u32::try_from(rel.target)
                .ok()
                .and_then(|t| self.anchors.get(&t).copied());
            match anchor {
                Some(index) => rel.target_piece = index,
                None => {
                    unmapped.push((rel.instr.ip() as u32, rel.target));
                    *piece = Piece::Bytes(std::mem::take(&mut rel.original));
                }
            }
        }

        // Re-encode until no piece changes size. Pieces only move from
        // original to re-encoded and from short to near, so this settles.
        let mut starts = vec![0usize; self.pieces.len() + 1];
        loop {
            for (i, piece) in self.pieces.iter().enumerate() {
                starts[i + 1] = starts[i] + piece.len();
            }

            let mut changed = false;
            for i in 0..self.pieces.len() {
                let ip = starts[i] as u64;
                if let Piece::Relative(rel) = &mut self.pieces[i] {
                    let target = starts[rel.target_piece] as u64;
                    let before = rel.encoded.len();
                    rel.encode(ip, target)?;
                    changed |= rel.encoded.len() != before;
                }
            }
            if !changed {
                break;
            }
        }

        let mut bytes = Vec::with_capacity(starts[self.pieces.len()]);
        let mut relocated = 0;
        for piece in &self.pieces {
            bytes.extend_from_slice(piece.bytes());
            if let Piece::Relative(rel) = piece {
                if rel.reencoded {
                    relocated += 1;
                }
            }
        }

        let marks = self
            .marks
            .iter()
            .map(|&(piece, offset)| (starts[piece] + offset as usize) as u32)
            .collect();

        Ok(Assembled {
            bytes,
            marks,
            unmapped,
            relocated,
        })
    }
}

// ============================================================================
// Rewrite Driver
// ============================================================================

/// One decoded instruction offered to a rewriting stage.
#[derive(Clone, Copy, Debug)]
pub struct Site<'a> {
    /// Index into [`DecodedStream::instructions`].
    pub index: usize,
    pub instr: &'a Instruction,
    /// Original encoding.
    pub bytes: &'a [u8],
    /// Offset in the original stream.
    pub offset: u32,
}

/// Counters shared by the rewriting stages.
#[derive(Clone, Debug, Default)]
pub struct RewriteSummary {
    pub instructions: usize,
    /// Instructions copied verbatim because they carry a fixup.
    pub pinned: usize,
    /// Branches and RIP-relative operands re-encoded.
    pub relocated: usize,
    pub input_len: usize,
    pub output_len: usize,
    /// Final offset of every builder mark, by mark index.
    pub marks: Vec<u32>,
}

/// Rewrite `function` one instruction at a time.
///
/// Instructions overlapping a fixup are copied verbatim and their fixups
/// carried to the new offset; every other instruction is handed to `visit`,
/// which must push its replacement into the builder. On return the function
/// holds the new bytes with fixups remapped and bounds-checked, and
/// [`RewriteSummary::marks`] resolves any marks `visit` made.
pub fn rewrite<F>(
    function: &mut Function,
    decoded: &DecodedStream,
    stage: &'static str,
    diagnostics: &mut Vec<Diagnostic>,
    mut visit: F,
) -> Result<RewriteSummary>
where
    F: FnMut(&mut StreamBuilder, &Site<'_>) -> Result<()>,
{
    let fixups = FixupMap::from_function(function);
    let qualified = function.qualified_name();

    if let Some(truncated_at) = decoded.truncated_at {
        if let Some(lost) = fixups.iter().find(|f| f.offset + f.width > truncated_at) {
            return Err(Error::FixupLost {
                offset: lost.offset,
                truncated_at,
            });
        }
        let diag = Diagnostic {
            function: qualified.clone(),
            stage,
            kind: DiagnosticKind::DecodeTruncation {
                offset: truncated_at,
                dropped: (decoded.code_len - truncated_at) as usize,
            },
        };
        tracing::warn!("{}", diag);
        diagnostics.push(diag);
    }

    let code = &function.bytes;
    let mut builder = StreamBuilder::new(decoded.code_len);
    let mut marked: Vec<(usize, FixupRef)> = Vec::new();
    let mut summary = RewriteSummary {
        input_len: code.len(),
        ..Default::default()
    };

    for (index, instr) in decoded.instructions.iter().enumerate() {
        let offset = instr.ip() as u32;
        let bytes = &code[offset as usize..offset as usize + instr.len()];
        summary.instructions += 1;
        builder.begin_instruction(offset);

        let mut hits = fixups.overlapping(offset, instr.len()).peekable();
        if hits.peek().is_some() {
            let piece = builder.push_instruction(instr, bytes);
            for hit in hits.filter(|f| f.offset >= offset) {
                marked.push((builder.mark(piece, hit.offset - offset), *hit));
            }
            summary.pinned += 1;
            continue;
        }

        visit(
            &mut builder,
            &Site {
                index,
                instr,
                bytes,
                offset,
            },
        )?;
    }

    let end = match decoded.truncated_at {
        Some(_) => None,
        None => Some(decoded.code_len),
    };
    let assembled = builder.finish(end)?;

    for &(offset, target) in &assembled.unmapped {
        let diag = Diagnostic {
            function: qualified.clone(),
            stage,
            kind: DiagnosticKind::UnmappedTarget { offset, target },
        };
        tracing::warn!("{}", diag);
        diagnostics.push(diag);
    }

    let remapped: Vec<(FixupRef, u32)> = marked
        .into_iter()
        .map(|(mark, fixup)| (fixup, assembled.marks[mark]))
        .collect();
    summary.relocated = assembled.relocated;
    summary.output_len = assembled.bytes.len();
    summary.marks = assembled.marks;

    function.bytes = assembled.bytes;
    fixup::apply_remap(function, &remapped);
    fixup::validate_bounds(function)?;

    Ok(summary)
}
