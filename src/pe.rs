//! PE format parsing and image mapping.
//!
//! This module parses PE32+ headers out of an on-disk file and expands the
//! file into a flat, RVA-addressable image: headers at offset 0 and every
//! section at its virtual address, with zero-filled gaps. All later stages
//! address the binary through [`MappedImage`] and never through raw pointers.

use crate::error::{Error, Result};

// PE format constants
pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const MACHINE_AMD64: u16 = 0x8664;
pub const OPTIONAL_HDR64_MAGIC: u16 = 0x20B;

/// Index of the import table in the data directory array.
pub const DIRECTORY_ENTRY_IMPORT: usize = 1;

// Section characteristics
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// DOS header (64 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct DosHeader {
    pub e_magic: u16,      // Magic number ("MZ")
    pub e_cblp: u16,       // Bytes on last page of file
    pub e_cp: u16,         // Pages in file
    pub e_crlc: u16,       // Relocations
    pub e_cparhdr: u16,    // Size of header in paragraphs
    pub e_minalloc: u16,   // Minimum extra paragraphs needed
    pub e_maxalloc: u16,   // Maximum extra paragraphs needed
    pub e_ss: u16,         // Initial SS value
    pub e_sp: u16,         // Initial SP value
    pub e_csum: u16,       // Checksum
    pub e_ip: u16,         // Initial IP value
    pub e_cs: u16,         // Initial CS value
    pub e_lfarlc: u16,     // File address of relocation table
    pub e_ovno: u16,       // Overlay number
    pub e_res: [u16; 4],   // Reserved words
    pub e_oemid: u16,      // OEM identifier
    pub e_oeminfo: u16,    // OEM information
    pub e_res2: [u16; 10], // Reserved words
    pub e_lfanew: i32,     // File address of new exe header (PE offset)
}

impl DosHeader {
    /// Create a minimal valid DOS header.
    pub fn minimal(pe_offset: u32) -> Self {
        Self {
            e_magic: DOS_MAGIC,
            e_cblp: 0x90,
            e_cp: 0x03,
            e_crlc: 0,
            e_cparhdr: 0x04,
            e_minalloc: 0,
            e_maxalloc: 0xFFFF,
            e_ss: 0,
            e_sp: 0xB8,
            e_csum: 0,
            e_ip: 0,
            e_cs: 0,
            e_lfarlc: 0x40,
            e_ovno: 0,
            e_res: [0; 4],
            e_oemid: 0,
            e_oeminfo: 0,
            e_res2: [0; 10],
            e_lfanew: pe_offset as i32,
        }
    }
}

/// COFF file header (20 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// Data directory entry.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// Optional header (PE32+, 64-bit).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    // Data directories follow (typically 16)
}

/// Section header (40 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Get the section name as a string (trimmed of null bytes).
    pub fn name_str(&self) -> &str {
        let name_slice = &self.name;
        let end = name_slice.iter().position(|&b| b == 0).unwrap_or(8);
        std::str::from_utf8(&name_slice[..end]).unwrap_or("")
    }

    /// Create a new section header with the given name.
    pub fn new(name: &str) -> Self {
        let mut header = Self {
            name: [0; 8],
            virtual_size: 0,
            virtual_address: 0,
            size_of_raw_data: 0,
            pointer_to_raw_data: 0,
            pointer_to_relocations: 0,
            pointer_to_linenumbers: 0,
            number_of_relocations: 0,
            number_of_linenumbers: 0,
            characteristics: 0,
        };
        let name_bytes = name.as_bytes();
        let len = name_bytes.len().min(8);
        header.name[..len].copy_from_slice(&name_bytes[..len]);
        header
    }
}

/// Import directory entry (20 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ImportDescriptor {
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name: u32,
    pub first_thunk: u32,
}

impl ImportDescriptor {
    /// The all-zero descriptor terminates the import directory.
    pub fn is_terminator(&self) -> bool {
        let name = self.name;
        let first_thunk = self.first_thunk;
        name == 0 && first_thunk == 0
    }
}

/// Read a packed header struct out of a byte buffer.
///
/// Only used with the `#[repr(C, packed)]` integer structs above, for which
/// every bit pattern is valid.
pub fn read_struct<T: Copy>(buf: &[u8], offset: usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    let end = offset
        .checked_add(size)
        .filter(|&end| end <= buf.len())
        .ok_or(Error::HeadersTooSmall {
            expected: offset.saturating_add(size),
            actual: buf.len(),
        })?;
    // SAFETY: the range [offset, end) was bounds-checked above and T is a
    // packed plain-old-data header type.
    Ok(unsafe { std::ptr::read_unaligned(buf[offset..end].as_ptr() as *const T) })
}

/// Append a packed header struct to a byte buffer.
pub fn write_struct<T: Copy>(buf: &mut Vec<u8>, value: &T) {
    // SAFETY: T is a packed plain-old-data header type with no padding.
    let bytes = unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    };
    buf.extend_from_slice(bytes);
}

/// Parsed section information.
#[derive(Clone, Debug)]
pub struct SectionInfo {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl From<&SectionHeader> for SectionInfo {
    fn from(header: &SectionHeader) -> Self {
        Self {
            name: header.name_str().to_string(),
            virtual_size: header.virtual_size,
            virtual_address: header.virtual_address,
            size_of_raw_data: header.size_of_raw_data,
            pointer_to_raw_data: header.pointer_to_raw_data,
            characteristics: header.characteristics,
        }
    }
}

/// Parsed PE32+ metadata from an on-disk file.
#[derive(Clone, Debug)]
pub struct PeParser {
    /// Offset to PE signature (e_lfanew).
    pub pe_offset: u32,
    /// Machine type.
    pub machine: u16,
    /// Preferred image base.
    pub image_base: u64,
    /// Section alignment.
    pub section_alignment: u32,
    /// Size of image.
    pub size_of_image: u32,
    /// Size of headers.
    pub size_of_headers: u32,
    /// Data directories, in header order.
    pub data_directories: Vec<DataDirectory>,
    /// Parsed section information.
    pub sections: Vec<SectionInfo>,
}

impl PeParser {
    /// Parse PE headers from the raw bytes of a file.
    pub fn parse(file: &[u8]) -> Result<Self> {
        let dos_header: DosHeader = read_struct(file, 0)?;
        if dos_header.e_magic != DOS_MAGIC {
            return Err(Error::InvalidDosSignature(0));
        }

        let e_lfanew = dos_header.e_lfanew;
        if e_lfanew < 0 {
            return Err(Error::MalformedImage(format!("negative e_lfanew {}", e_lfanew)));
        }
        let pe_offset = e_lfanew as u32;
        let pe_header_start = pe_offset as usize;

        let pe_sig: u32 = read_struct(file, pe_header_start)?;
        if pe_sig != PE_SIGNATURE {
            return Err(Error::InvalidPeSignature(pe_header_start));
        }

        let file_header: FileHeader = read_struct(file, pe_header_start + 4)?;
        let machine = file_header.machine;
        if machine != MACHINE_AMD64 {
            return Err(Error::UnsupportedMachine(machine));
        }

        let opt_header_start = pe_header_start + 4 + std::mem::size_of::<FileHeader>();
        let size_of_optional_header = file_header.size_of_optional_header as usize;
        if size_of_optional_header < std::mem::size_of::<OptionalHeader64>() {
            return Err(Error::HeadersTooSmall {
                expected: std::mem::size_of::<OptionalHeader64>(),
                actual: size_of_optional_header,
            });
        }

        let opt: OptionalHeader64 = read_struct(file, opt_header_start)?;
        if opt.magic != OPTIONAL_HDR64_MAGIC {
            return Err(Error::MalformedImage(format!(
                "optional header magic 0x{:X} is not PE32+",
                { opt.magic }
            )));
        }

        // Data directories follow the fixed part of the optional header
        let dir_start = opt_header_start + std::mem::size_of::<OptionalHeader64>();
        let dir_room = (size_of_optional_header - std::mem::size_of::<OptionalHeader64>())
            / std::mem::size_of::<DataDirectory>();
        let dir_count = (opt.number_of_rva_and_sizes as usize).min(dir_room);
        let mut data_directories = Vec::with_capacity(dir_count);
        for i in 0..dir_count {
            data_directories.push(read_struct::<DataDirectory>(
                file,
                dir_start + i * std::mem::size_of::<DataDirectory>(),
            )?);
        }

        let section_header_start = opt_header_start + size_of_optional_header;
        let number_of_sections = file_header.number_of_sections as usize;
        let mut sections = Vec::with_capacity(number_of_sections);
        for i in 0..number_of_sections {
            let section_offset = section_header_start + i * std::mem::size_of::<SectionHeader>();
            let section_header: SectionHeader = read_struct(file, section_offset)?;
            sections.push(SectionInfo::from(&section_header));
        }

        Ok(Self {
            pe_offset,
            machine,
            image_base: opt.image_base,
            section_alignment: opt.section_alignment,
            size_of_image: opt.size_of_image,
            size_of_headers: opt.size_of_headers,
            data_directories,
            sections,
        })
    }

    /// Look up a data directory, treating absent or empty entries as `None`.
    pub fn data_directory(&self, index: usize) -> Option<DataDirectory> {
        self.data_directories
            .get(index)
            .copied()
            .filter(|dir| dir.virtual_address != 0 && dir.size != 0)
    }
}

// ============================================================================
// Mapped Image
// ============================================================================

/// A PE file expanded to its in-memory layout, addressed by RVA.
#[derive(Clone, Debug)]
pub struct MappedImage {
    /// Image bytes, `size_of_image` long.
    data: Vec<u8>,
    /// Parsed headers.
    headers: PeParser,
}

impl MappedImage {
    /// Parse `file` and lay its headers and sections out at their RVAs.
    pub fn from_file_bytes(file: &[u8]) -> Result<Self> {
        let headers = PeParser::parse(file)?;
        let size = headers.size_of_image as usize;
        if size == 0 {
            return Err(Error::MalformedImage("SizeOfImage is zero".to_string()));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::ResourceExhausted { requested: size })?;
        data.resize(size, 0);

        // Copy over headers
        let header_len = (headers.size_of_headers as usize).min(file.len()).min(size);
        data[..header_len].copy_from_slice(&file[..header_len]);

        // Copy over all sections
        for section in &headers.sections {
            if section.pointer_to_raw_data == 0 || section.size_of_raw_data == 0 {
                continue;
            }
            let src_start = section.pointer_to_raw_data as usize;
            let dst_start = section.virtual_address as usize;
            if src_start >= file.len() || dst_start >= size {
                tracing::warn!(
                    "section {} (RVA 0x{:X}) lies outside the file or image, skipping",
                    section.name,
                    section.virtual_address
                );
                continue;
            }
            let len = (section.size_of_raw_data as usize)
                .min(file.len() - src_start)
                .min(size - dst_start);
            data[dst_start..dst_start + len].copy_from_slice(&file[src_start..src_start + len]);
        }

        tracing::debug!(
            "mapped image: {} sections, 0x{:X} bytes",
            headers.sections.len(),
            size
        );

        Ok(Self { data, headers })
    }

    /// Parsed headers.
    pub fn headers(&self) -> &PeParser {
        &self.headers
    }

    /// Total mapped size.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the mapping is empty (never true for a parsed image).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bounds-checked view of `len` bytes at `rva`.
    pub fn slice(&self, rva: u32, len: usize) -> Option<&[u8]> {
        let start = rva as usize;
        let end = start.checked_add(len)?;
        self.data.get(start..end)
    }

    /// Read a little-endian u64 at `rva`.
    pub fn read_u64(&self, rva: u32) -> Option<u64> {
        let b = self.slice(rva, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Some(u64::from_le_bytes(raw))
    }

    /// Read a packed header struct at `rva`.
    pub fn read_struct<T: Copy>(&self, rva: u32) -> Result<T> {
        read_struct(&self.data, rva as usize)
    }

    /// Read a NUL-terminated ASCII string at `rva`.
    pub fn c_str(&self, rva: u32) -> Option<String> {
        let tail = self.data.get(rva as usize..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&tail[..end]).into_owned())
    }
}
