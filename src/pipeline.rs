//! Batch driver.
//!
//! Runs every matching function of one binary through the full pipeline:
//! 1. Map the image and select symbols by marker term
//! 2. Extract each function's bytes
//! 3. Rewrite import references into patchable stubs
//! 4. Locate placeholder variables
//! 5. Obfuscate
//!
//! A function whose stage fails is excluded from the batch with the stage
//! and reason; the batch itself only fails on errors that leave nothing to
//! process.

use crate::error::{Error, Result};
use crate::extractor::{self, DEFAULT_SEARCH_TERM};
use crate::fixup;
use crate::function::{Diagnostic, Function, VariableWidth};
use crate::imports::{self, ImportResolver, ImportTable};
use crate::obfuscator::{self, Obfuscator, ObfuscatorSettings};
use crate::pe::MappedImage;
use crate::symbols::{FunctionMetadata, SymbolProvider};
use crate::variables;
use crate::writer::OutputWriter;

use std::path::{Path, PathBuf};

const EXTRACT_STAGE: &str = "extract";
const VARIABLES_STAGE: &str = "variables";

/// Progress stage during a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStage {
    Initializing,
    Extracting,
    ResolvingImports,
    ScanningVariables,
    Obfuscating,
    Writing,
    Complete,
}

impl ProgressStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Extracting => "Extracting functions",
            Self::ResolvingImports => "Resolving imports",
            Self::ScanningVariables => "Scanning variables",
            Self::Obfuscating => "Obfuscating",
            Self::Writing => "Writing headers",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during a batch.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    /// Current stage.
    pub stage: ProgressStage,
    /// Function being processed.
    pub current_item: Option<String>,
    /// Functions handled so far.
    pub current: usize,
    /// Functions selected.
    pub total: usize,
    /// Import stubs emitted so far.
    pub imports_rewritten: usize,
    /// Variable occurrences found so far.
    pub variables_found: usize,
    /// Output code bytes so far.
    pub bytes_out: usize,
}

impl Default for ProgressInfo {
    fn default() -> Self {
        Self {
            stage: ProgressStage::Initializing,
            current_item: None,
            current: 0,
            total: 0,
            imports_rewritten: 0,
            variables_found: 0,
            bytes_out: 0,
        }
    }
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Configuration for a batch.
pub struct PipelineConfig {
    /// Substring selecting the functions to extract.
    pub search_term: String,
    /// Obfuscation settings.
    pub obfuscation: ObfuscatorSettings,
    /// Fixed seed for reproducible output; random when `None`.
    pub seed: Option<u64>,
    /// Progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("search_term", &self.search_term)
            .field("obfuscation", &self.obfuscation)
            .field("seed", &self.seed)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            search_term: DEFAULT_SEARCH_TERM.to_string(),
            obfuscation: ObfuscatorSettings::default(),
            seed: None,
            progress_callback: None,
        }
    }
}

/// A function left out of the batch.
#[derive(Clone, Debug)]
pub struct Excluded {
    /// Symbol name.
    pub name: String,
    /// Stage that failed.
    pub stage: &'static str,
    pub reason: String,
}

/// Aggregate statistics for a batch.
#[derive(Default, Debug, Clone)]
pub struct BatchStats {
    pub imports_rewritten: usize,
    pub unresolved_imports: usize,
    pub variables: usize,
    pub instructions_rewritten: usize,
    pub junk_instructions: usize,
    pub bytes_in: usize,
    pub bytes_out: usize,
}

/// Result of a batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Fully processed functions, in symbol order.
    pub functions: Vec<Function>,
    pub excluded: Vec<Excluded>,
    pub diagnostics: Vec<Diagnostic>,
    pub stats: BatchStats,
}

/// Drives the pipeline over one binary.
pub struct Pipeline {
    config: PipelineConfig,
    obfuscator: Obfuscator,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let settings = config.obfuscation.clone();
        let obfuscator = match config.seed {
            Some(seed) => Obfuscator::with_seed(settings, seed),
            None => Obfuscator::new(settings),
        };
        Self { config, obfuscator }
    }

    fn report(&self, progress: &ProgressInfo) {
        if let Some(ref cb) = self.config.progress_callback {
            cb(progress);
        }
    }

    /// Process every matching function of the PE file in `image_bytes`.
    pub fn run(&mut self, image_bytes: &[u8], symbols: &dyn SymbolProvider) -> Result<BatchReport> {
        let mut progress = ProgressInfo::default();
        self.report(&progress);

        let image = MappedImage::from_file_bytes(image_bytes)?;
        let symbols = symbols.functions()?;
        self.run_image(&image, &symbols, &mut progress)
    }

    /// Process every matching function of an already mapped image.
    pub fn run_image(
        &mut self,
        image: &MappedImage,
        symbols: &[FunctionMetadata],
        progress: &mut ProgressInfo,
    ) -> Result<BatchReport> {
        let selected = extractor::select_symbols(symbols, &self.config.search_term)?;
        let table = ImportTable::from_image(image)?;
        let resolver = ImportResolver::new(&table);

        let mut report = BatchReport::default();
        progress.total = selected.len();

        for (index, metadata) in selected.into_iter().enumerate() {
            progress.current = index;
            progress.current_item = Some(metadata.name.clone());

            let mut diagnostics = Vec::new();
            let outcome = self.process_function(
                image,
                &resolver,
                metadata,
                progress,
                &mut report.stats,
                &mut diagnostics,
            );
            report.diagnostics.append(&mut diagnostics);

            match outcome {
                Ok(function) => {
                    tracing::info!(
                        "{}: {} bytes, {} variables, {} imports",
                        function.qualified_name(),
                        function.bytes.len(),
                        function.variables.len(),
                        function.dynamic_imports.len()
                    );
                    progress.bytes_out += function.bytes.len();
                    report.functions.push(function);
                }
                Err(err) => {
                    let (stage, reason) = match &err {
                        Error::Stage { stage, source, .. } => (*stage, source.to_string()),
                        other => (EXTRACT_STAGE, other.to_string()),
                    };
                    tracing::warn!("excluding '{}': {}", metadata.name, err);
                    report.excluded.push(Excluded {
                        name: metadata.name.clone(),
                        stage,
                        reason,
                    });
                }
            }
        }

        progress.stage = ProgressStage::Complete;
        progress.current = progress.total;
        progress.current_item = None;
        self.report(progress);

        tracing::info!(
            "processed {} functions, excluded {}, {} diagnostics",
            report.functions.len(),
            report.excluded.len(),
            report.diagnostics.len()
        );
        Ok(report)
    }

    /// Run one function through every stage.
    fn process_function(
        &mut self,
        image: &MappedImage,
        resolver: &ImportResolver<'_>,
        metadata: &FunctionMetadata,
        progress: &mut ProgressInfo,
        stats: &mut BatchStats,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Function> {
        let name = metadata.name.as_str();

        progress.stage = ProgressStage::Extracting;
        self.report(progress);
        let mut function = extractor::extract_function(image, metadata)
            .map_err(|e| e.in_stage(name, EXTRACT_STAGE))?;
        stats.bytes_in += function.bytes.len();

        progress.stage = ProgressStage::ResolvingImports;
        self.report(progress);
        let import_stats = resolver
            .resolve(&mut function, diagnostics)
            .map_err(|e| e.in_stage(name, imports::STAGE))?;
        stats.imports_rewritten += import_stats.rewritten();
        stats.unresolved_imports += import_stats.unresolved;
        progress.imports_rewritten += import_stats.rewritten();

        progress.stage = ProgressStage::ScanningVariables;
        self.report(progress);
        let var_stats = variables::scan_variables(&mut function);
        tracing::debug!(
            "{}: variable slots q{} d{} w{} b{}",
            name,
            var_stats.slots_of(VariableWidth::Qword),
            var_stats.slots_of(VariableWidth::Dword),
            var_stats.slots_of(VariableWidth::Word),
            var_stats.slots_of(VariableWidth::Byte)
        );
        fixup::validate_bounds(&function).map_err(|e| e.in_stage(name, VARIABLES_STAGE))?;
        stats.variables += var_stats.occurrences;
        progress.variables_found += var_stats.occurrences;

        progress.stage = ProgressStage::Obfuscating;
        self.report(progress);
        let fixups_before = function.fixup_count();
        let obf_stats = self
            .obfuscator
            .process(&mut function, diagnostics)
            .map_err(|e| e.in_stage(name, obfuscator::STAGE))?;
        debug_assert_eq!(fixups_before, function.fixup_count());
        stats.instructions_rewritten += obf_stats.rewritten();
        stats.junk_instructions += obf_stats.junk_instructions;
        stats.bytes_out += function.bytes.len();

        Ok(function)
    }

    /// Write the processed functions as C headers under `dir`.
    pub fn write_output(&self, report: &BatchReport, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut progress = ProgressInfo {
            stage: ProgressStage::Writing,
            total: report.functions.len(),
            ..Default::default()
        };
        self.report(&progress);

        let written = OutputWriter::new(dir).write(&report.functions)?;

        progress.stage = ProgressStage::Complete;
        progress.current = progress.total;
        self.report(&progress);
        Ok(written)
    }
}
