//! C header output.
//!
//! Every group becomes one `<group>.h`. Each function contributes its code
//! bytes, the placeholder variables to patch and the import stubs to fill:
//!
//! ```c
//! static const unsigned char Console_Output_code[] = { 0x48, 0x89, ... };
//! #define Console_Output_SIZE 42
//! static const shellcarve_variable Console_Output_variables[] = { { 1, 4, 0x10 } };
//! #define Console_Output_VARIABLE_COUNT 1
//! ```

use crate::error::Result;
use crate::fixup;
use crate::function::Function;

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

const BYTES_PER_LINE: usize = 16;

const PREAMBLE: &str = "\
#pragma once
/* Generated by shellcarve. Do not edit. */

#include <stdint.h>

#ifndef SHELLCARVE_TYPES
#define SHELLCARVE_TYPES
typedef struct {
    uint32_t slot;
    uint32_t width;
    uint32_t offset;
} shellcarve_variable;

typedef struct {
    const char *module;
    const char *function;
    uint32_t offset;
} shellcarve_import;
#endif
";

/// Replace anything that is not valid in a C identifier.
fn c_identifier(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn c_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for b in raw.bytes() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7E => out.push(b as char),
            // Close the literal so a following hex digit is not absorbed
            _ => out.push_str(&format!("\\x{:02X}\"\"", b)),
        }
    }
    out.push('"');
    out
}

/// Writes processed functions as C headers.
pub struct OutputWriter {
    dir: PathBuf,
}

impl OutputWriter {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Header path for `group`.
    pub fn header_path(&self, group: &str) -> PathBuf {
        self.dir.join(format!("{}.h", c_identifier(group)))
    }

    /// Write one header per group, returning the paths written.
    pub fn write(&self, functions: &[Function]) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.dir)?;

        let mut groups: BTreeMap<&str, Vec<&Function>> = BTreeMap::new();
        for function in functions {
            groups.entry(function.group.as_str()).or_default().push(function);
        }

        let mut written = Vec::with_capacity(groups.len());
        for (group, members) in groups {
            let text = render_group(group, &members)?;
            let path = self.header_path(group);

            let mut file = File::create(&path)?;
            file.write_all(text.as_bytes())?;

            tracing::info!("wrote {} ({} functions)", path.display(), members.len());
            written.push(path);
        }
        Ok(written)
    }
}

/// Render the header text for one group.
///
/// Functions whose identifiers collide get a numeric suffix in input order.
pub fn render_group(group: &str, functions: &[&Function]) -> Result<String> {
    let mut out = String::from(PREAMBLE);
    let mut taken = HashSet::new();

    for function in functions {
        fixup::validate_bounds(function)?;

        let base = format!("{}_{}", c_identifier(group), c_identifier(&function.name));
        let mut ident = base.clone();
        let mut n = 2;
        while !taken.insert(ident.clone()) {
            ident = format!("{}_{}", base, n);
            n += 1;
        }
        if ident != base {
            tracing::warn!(
                "{} ({}) collides with an earlier function, emitted as {}",
                function.qualified_name(),
                function.metadata.name,
                ident
            );
        }

        render_function(&mut out, &ident, function)?;
    }
    Ok(out)
}

fn render_function(out: &mut String, ident: &str, function: &Function) -> std::fmt::Result {
    writeln!(out)?;
    writeln!(
        out,
        "/* {} ({} bytes) */",
        function.qualified_name().replace("*/", "* /"),
        function.bytes.len()
    )?;

    writeln!(out, "#define {}_SIZE {}", ident, function.bytes.len())?;
    if function.bytes.is_empty() {
        writeln!(out, "static const unsigned char {}_code[1] = {{ 0 }};", ident)?;
    } else {
        writeln!(out, "static const unsigned char {}_code[] = {{", ident)?;
        for chunk in function.bytes.chunks(BYTES_PER_LINE) {
            let line: Vec<String> = chunk.iter().map(|b| format!("0x{:02X}", b)).collect();
            writeln!(out, "    {},", line.join(", "))?;
        }
        writeln!(out, "}};")?;
    }

    writeln!(
        out,
        "#define {}_VARIABLE_COUNT {}",
        ident,
        function.variables.len()
    )?;
    if !function.variables.is_empty() {
        writeln!(out, "static const shellcarve_variable {}_variables[] = {{", ident)?;
        for var in &function.variables {
            writeln!(
                out,
                "    {{ {}, {}, 0x{:X} }},",
                var.slot,
                var.width.bytes(),
                var.offset
            )?;
        }
        writeln!(out, "}};")?;
    }

    writeln!(
        out,
        "#define {}_IMPORT_COUNT {}",
        ident,
        function.dynamic_imports.len()
    )?;
    if !function.dynamic_imports.is_empty() {
        writeln!(out, "static const shellcarve_import {}_imports[] = {{", ident)?;
        for import in &function.dynamic_imports {
            writeln!(
                out,
                "    {{ {}, {}, 0x{:X} }},",
                c_string(&import.module),
                c_string(&import.function),
                import.offset
            )?;
        }
        writeln!(out, "}};")?;
    }
    Ok(())
}
