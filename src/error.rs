//! Error types for shellcarve.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while carving functions out of an image.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid DOS signature at offset 0x{0:X}")]
    InvalidDosSignature(usize),

    #[error("invalid PE signature at offset 0x{0:X}")]
    InvalidPeSignature(usize),

    #[error("unsupported machine type: 0x{0:X}")]
    UnsupportedMachine(u16),

    #[error("PE headers too small: expected {expected}, got {actual}")]
    HeadersTooSmall { expected: usize, actual: usize },

    #[error("malformed image: {0}")]
    MalformedImage(String),

    #[error("could not allocate {requested} bytes for the mapped image")]
    ResourceExhausted { requested: usize },

    #[error("no symbols found matching '{term}'")]
    NoSymbolsFound { term: String },

    #[error("symbol listing line {line}: {reason}")]
    SymbolParse { line: usize, reason: String },

    #[error("function '{name}' (RVA 0x{offset:X}, {length} bytes) lies outside the image")]
    FunctionOutOfBounds {
        name: String,
        offset: u32,
        length: usize,
    },

    #[error("fixup at offset 0x{offset:X} (width {width}) is outside a {len}-byte function")]
    FixupOutOfBounds { offset: u32, width: u32, len: usize },

    #[error("fixup at offset 0x{offset:X} was dropped by a decode truncation at 0x{truncated_at:X}")]
    FixupLost { offset: u32, truncated_at: u32 },

    #[error("branch at offset 0x{offset:X} cannot reach its relocated target")]
    BranchOutOfRange { offset: u32 },

    #[error("{stage} failed for '{function}': {source}")]
    Stage {
        function: String,
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("instruction encoding failed: {0}")]
    Encode(#[from] iced_x86::IcedError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("header formatting failed: {0}")]
    Format(#[from] std::fmt::Error),
}

impl Error {
    /// Whether this error means the input is not a usable PE32+ image.
    pub fn is_image_format(&self) -> bool {
        matches!(
            self,
            Self::InvalidDosSignature(_)
                | Self::InvalidPeSignature(_)
                | Self::UnsupportedMachine(_)
                | Self::HeadersTooSmall { .. }
                | Self::MalformedImage(_)
        )
    }

    /// Attach function and stage context.
    pub fn in_stage(self, function: &str, stage: &'static str) -> Self {
        Self::Stage {
            function: function.to_string(),
            stage,
            source: Box::new(self),
        }
    }
}
