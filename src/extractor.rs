//! Function extraction.
//!
//! Selects the symbols whose name contains the marker term and slices their
//! bytes out of the mapped image.

use crate::error::{Error, Result};
use crate::function::Function;
use crate::pe::MappedImage;
use crate::symbols::FunctionMetadata;

/// Default marker carried by every shellcode function name.
pub const DEFAULT_SEARCH_TERM: &str = "__CODE__";

/// Split a qualified symbol name into `(group, name)`.
///
/// The group is everything before the first `:` (`"global"` when that is
/// empty, `"unknown"` when there is no `:`). The name is everything after the
/// last `_`, but only when a group separator was present; otherwise the
/// symbol name is kept untouched.
pub fn split_qualified_name(qualified: &str) -> (String, String) {
    let Some(colon) = qualified.find(':') else {
        return ("unknown".to_string(), qualified.to_string());
    };

    let group = match &qualified[..colon] {
        "" => "global".to_string(),
        g => g.to_string(),
    };

    let name = match qualified.rfind('_') {
        Some(underscore) => qualified[underscore + 1..].to_string(),
        None => qualified.to_string(),
    };

    (group, name)
}

/// Build the unrefined `Function` for one symbol.
pub fn extract_function(image: &MappedImage, metadata: &FunctionMetadata) -> Result<Function> {
    let bytes = image
        .slice(metadata.offset, metadata.length)
        .ok_or_else(|| Error::FunctionOutOfBounds {
            name: metadata.name.clone(),
            offset: metadata.offset,
            length: metadata.length,
        })?
        .to_vec();

    let (group, name) = split_qualified_name(&metadata.name);

    Ok(Function {
        group,
        name,
        bytes,
        variables: Vec::new(),
        dynamic_imports: Vec::new(),
        metadata: metadata.clone(),
    })
}

/// Symbols whose name contains `term`.
pub fn select_symbols<'a>(
    symbols: &'a [FunctionMetadata],
    term: &str,
) -> Result<Vec<&'a FunctionMetadata>> {
    let matches: Vec<_> = symbols.iter().filter(|s| s.name.contains(term)).collect();
    if matches.is_empty() {
        return Err(Error::NoSymbolsFound {
            term: term.to_string(),
        });
    }
    tracing::info!(
        "{} of {} symbols match '{}'",
        matches.len(),
        symbols.len(),
        term
    );
    Ok(matches)
}
