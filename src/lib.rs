//! # shellcarve
//!
//! Turns marked x86-64 functions of a compiled PE image into self-contained,
//! position-independent machine code with a table of patch points.
//!
//! ## Overview
//!
//! Functions whose symbol name contains a marker term (`__CODE__` by default)
//! are carved out of the mapped image and run through a fixed pipeline:
//!
//! 1. Import calls through the IAT are rewritten into `mov rax, imm64; call rax`
//!    stubs whose immediate is recorded for the loader to patch
//! 2. Sentinel constants marking runtime variables are located and zeroed
//! 3. The code is obfuscated with junk, instruction substitution, constant
//!    encoding and mixed boolean-arithmetic identities
//!
//! Every rewrite rebuilds the instruction stream, relocating relative branches
//! and keeping every recorded patch point aligned with the bytes it refers to.
//! The result is written as one C header per group.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![allow(clippy::too_many_arguments)]

pub mod error;
pub mod pe;
pub mod symbols;
pub mod function;
pub mod extractor;
pub mod fixup;
pub mod stream;
pub mod flags;
pub mod emit;
pub mod junk;
pub mod mba;
pub mod imports;
pub mod variables;
pub mod obfuscator;
pub mod pipeline;
pub mod writer;

pub use error::{Error, Result};
pub use extractor::DEFAULT_SEARCH_TERM;
pub use function::{Diagnostic, DiagnosticKind, DynamicImport, Function, Variable, VariableWidth};
pub use imports::{ImportResolver, ImportTable};
pub use obfuscator::{Obfuscator, ObfuscatorSettings};
pub use pe::{MappedImage, PeParser};
pub use pipeline::{
    BatchReport, Excluded, Pipeline, PipelineConfig, ProgressCallback, ProgressInfo, ProgressStage,
};
pub use symbols::{FunctionMetadata, SymbolListing, SymbolProvider};
pub use writer::OutputWriter;
