//! shellcarve CLI - carve marked functions out of a PE image into
//! position-independent shellcode headers.

use bytesize::ByteSize;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

use shellcarve::{
    extractor, ImportTable, MappedImage, ObfuscatorSettings, Pipeline, PipelineConfig,
    ProgressInfo, ProgressStage, SymbolListing, SymbolProvider, DEFAULT_SEARCH_TERM,
};

/// Extract marked functions from a PE image as relocatable, obfuscated shellcode.
#[derive(Parser)]
#[command(name = "shellcarve")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ObfuscationArgs {
    /// Disable junk instruction insertion
    #[arg(long)]
    no_junk: bool,

    /// Disable instruction substitution
    #[arg(long)]
    no_substitution: bool,

    /// Disable constant encoding
    #[arg(long)]
    no_constants: bool,

    /// Enable mixed boolean-arithmetic rewriting
    #[arg(long)]
    mba: bool,

    /// Nesting depth for MBA identities (1-3)
    #[arg(long, default_value = "1")]
    mba_depth: u32,

    /// Insert junk before an instruction with probability 1/N
    #[arg(long, default_value = "3")]
    junk_before_odds: u32,

    /// Insert junk after an instruction with probability 1/N
    #[arg(long, default_value = "4")]
    junk_after_odds: u32,
}

impl ObfuscationArgs {
    fn settings(&self) -> ObfuscatorSettings {
        ObfuscatorSettings {
            junk_insertion: !self.no_junk,
            instruction_substitution: !self.no_substitution,
            constant_encoding: !self.no_constants,
            mba_obfuscation: self.mba,
            mba_depth: self.mba_depth,
            junk_before_odds: self.junk_before_odds,
            junk_after_odds: self.junk_after_odds,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Carve marked functions and write one C header per group
    Generate {
        /// PE32+ image to carve from
        #[arg(short, long)]
        image: PathBuf,

        /// Symbol listing (`<rva-hex> <length> <name>` per line)
        #[arg(short, long)]
        symbols: PathBuf,

        /// Output directory for the headers
        #[arg(short, long)]
        output: PathBuf,

        /// Substring that marks functions to carve
        #[arg(long, default_value = DEFAULT_SEARCH_TERM)]
        search_term: String,

        /// Seed for reproducible output
        #[arg(long)]
        seed: Option<u64>,

        #[command(flatten)]
        obfuscation: ObfuscationArgs,
    },

    /// List the functions a symbol listing would carve
    List {
        /// Symbol listing
        #[arg(short, long)]
        symbols: PathBuf,

        /// Substring that marks functions to carve
        #[arg(long, default_value = DEFAULT_SEARCH_TERM)]
        search_term: String,
    },

    /// Print the import table of a PE image
    Imports {
        /// PE32+ image
        #[arg(short, long)]
        image: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            image,
            symbols,
            output,
            search_term,
            seed,
            obfuscation,
        } => {
            generate(&image, &symbols, &output, search_term, seed, obfuscation.settings())?;
        }

        Commands::List {
            symbols,
            search_term,
        } => {
            list(&symbols, &search_term)?;
        }

        Commands::Imports { image } => {
            imports(&image)?;
        }
    }

    Ok(())
}

fn generate(
    image: &Path,
    symbols: &Path,
    output: &Path,
    search_term: String,
    seed: Option<u64>,
    settings: ObfuscatorSettings,
) -> anyhow::Result<()> {
    println!("Image: {}", image.display());
    println!("Output: {}", output.display());

    let image_bytes = std::fs::read(image)?;
    let listing = SymbolListing::from_file(symbols)?;

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let pb_clone = pb.clone();
    let config = PipelineConfig {
        search_term,
        obfuscation: settings,
        seed,
        progress_callback: Some(Box::new(move |info: &ProgressInfo| {
            let pct = if info.total > 0 {
                (info.current as f64 / info.total as f64 * 100.0) as u64
            } else {
                0
            };

            let msg = match info.stage {
                ProgressStage::Extracting
                | ProgressStage::ResolvingImports
                | ProgressStage::ScanningVariables
                | ProgressStage::Obfuscating => {
                    let item = info.current_item.as_deref().unwrap_or("");
                    format!(
                        "{} - {} ({}, {} imports, {} vars)",
                        info.stage.name(),
                        item,
                        ByteSize::b(info.bytes_out as u64),
                        info.imports_rewritten,
                        info.variables_found
                    )
                }
                _ => info.stage.name().to_string(),
            };

            pb_clone.set_position(pct);
            pb_clone.set_message(msg);
        })),
    };

    let mut pipeline = Pipeline::new(config);
    let report = pipeline.run(&image_bytes, &listing)?;
    let written = pipeline.write_output(&report, output)?;

    pb.finish_with_message("Complete");

    for diagnostic in &report.diagnostics {
        println!("warning: {}", diagnostic);
    }
    for excluded in &report.excluded {
        println!(
            "excluded: {} ({} stage): {}",
            excluded.name, excluded.stage, excluded.reason
        );
    }

    println!(
        "\n{} functions carved, {} excluded: {} -> {}",
        report.functions.len(),
        report.excluded.len(),
        ByteSize::b(report.stats.bytes_in as u64),
        ByteSize::b(report.stats.bytes_out as u64)
    );
    for path in written {
        println!("  {}", path.display());
    }

    Ok(())
}

fn list(symbols: &Path, search_term: &str) -> anyhow::Result<()> {
    let listing = SymbolListing::from_file(symbols)?;
    let functions = listing.functions()?;
    let selected = extractor::select_symbols(&functions, search_term)?;

    println!("Marked functions ({}):", selected.len());
    println!("{:<12} {:>10}  {:<16} Name", "RVA", "Size", "Group");

    for metadata in selected {
        let (group, name) = extractor::split_qualified_name(&metadata.name);
        println!(
            "0x{:08X} {:>12}  {:<16} {}",
            metadata.offset,
            ByteSize::b(metadata.length as u64),
            group,
            name
        );
    }

    Ok(())
}

fn imports(image: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(image)?;
    let mapped = MappedImage::from_file_bytes(&bytes)?;
    let table = ImportTable::from_image(&mapped)?;

    println!("Import slots ({}):", table.len());
    for (slot, import) in table.iter() {
        println!("0x{:08X}  {}!{}", slot, import.module, import.function);
    }

    Ok(())
}
