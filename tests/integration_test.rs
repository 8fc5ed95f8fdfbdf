//! End-to-end tests over a synthetic PE32+ image.
//!
//! The image has two sections:
//! - `.text` at RVA 0x1000 holding a handful of small functions
//! - `.idata` at RVA 0x2000 importing `kernel32.dll!VirtualAlloc`, whose IAT
//!   slot sits at RVA 0x2060
//!
//! Symbols are supplied as a text listing, the same format the CLI reads.

use iced_x86::{Decoder, DecoderOptions, Instruction};
use shellcarve::pe::{
    write_struct, DataDirectory, DosHeader, FileHeader, ImportDescriptor, OptionalHeader64,
    SectionHeader, DIRECTORY_ENTRY_IMPORT, IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA,
    IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE, MACHINE_AMD64,
    OPTIONAL_HDR64_MAGIC, PE_SIGNATURE,
};
use shellcarve::{
    DiagnosticKind, Error, Function, ImportTable, MappedImage, ObfuscatorSettings, OutputWriter,
    Pipeline, PipelineConfig, ProgressInfo, ProgressStage, SymbolListing, VariableWidth,
};
use std::sync::{Arc, Mutex};

const PE_OFFSET: u32 = 0x80;
const HEADERS_SIZE: usize = 0x400;
const SIZE_OF_IMAGE: u32 = 0x3000;

const TEXT_RVA: u32 = 0x1000;
const TEXT_RAW: usize = 0x400;
const IDATA_RVA: u32 = 0x2000;
const IDATA_RAW: usize = 0x600;
const SECTION_RAW_SIZE: usize = 0x200;

const IAT_SLOT: u32 = IDATA_RVA + 0x60;

// Console:__CODE__Output
//   sub rsp, 0x28
//   mov ecx, <dword slot 1>
//   call [rip -> IAT_SLOT]
//   test eax, eax
//   je +2
//   xor eax, eax
//   add rsp, 0x28
//   ret
const OUTPUT_RVA: u32 = 0x1000;

// Math:__CODE__Add_sum
//   mov eax, ecx
//   add eax, edx
//   ret
const SUM_RVA: u32 = 0x1040;
const SUM: [u8; 5] = [0x89, 0xC8, 0x01, 0xD0, 0xC3];

// Math:__CODE__Loop_count
//   xor eax, eax
// l: add eax, 1
//   cmp eax, 10
//   jne l
//   ret
const COUNT_RVA: u32 = 0x1060;
const COUNT: [u8; 11] = [
    0x31, 0xC0, 0x83, 0xC0, 0x01, 0x83, 0xF8, 0x0A, 0x75, 0xF8, 0xC3,
];

// Net:__CODE__Send_raw
//   call [rip+0x100]   ; not an import slot
//   ret
const RAW_RVA: u32 = 0x10A0;
const RAW: [u8; 7] = [0xFF, 0x15, 0x00, 0x01, 0x00, 0x00, 0xC3];

// Unmarked helper
const HELPER_RVA: u32 = 0x10C0;

fn output_code() -> Vec<u8> {
    let mut code = vec![0x48, 0x83, 0xEC, 0x28, 0xB9];
    code.extend_from_slice(&(0xCAFE_BABEu32 - 1).to_le_bytes());
    // call [rip+disp] at offset 9, next ip 15
    let disp = IAT_SLOT - (OUTPUT_RVA + 15);
    code.extend([0xFF, 0x15]);
    code.extend_from_slice(&disp.to_le_bytes());
    code.extend([0x85, 0xC0, 0x74, 0x02, 0x31, 0xC0, 0x48, 0x83, 0xC4, 0x28, 0xC3]);
    code
}

fn place(file: &mut [u8], rva: u32, code: &[u8]) {
    let at = TEXT_RAW + (rva - TEXT_RVA) as usize;
    file[at..at + code.len()].copy_from_slice(code);
}

fn put(file: &mut [u8], rva: u32, bytes: &[u8]) {
    let at = IDATA_RAW + (rva - IDATA_RVA) as usize;
    file[at..at + bytes.len()].copy_from_slice(bytes);
}

fn section(name: &str, rva: u32, raw: usize, characteristics: u32) -> SectionHeader {
    let mut header = SectionHeader::new(name);
    header.virtual_size = SECTION_RAW_SIZE as u32;
    header.virtual_address = rva;
    header.size_of_raw_data = SECTION_RAW_SIZE as u32;
    header.pointer_to_raw_data = raw as u32;
    header.characteristics = characteristics;
    header
}

fn build_image() -> Vec<u8> {
    let mut file = Vec::new();
    write_struct(&mut file, &DosHeader::minimal(PE_OFFSET));
    file.resize(PE_OFFSET as usize, 0);
    file.extend_from_slice(&PE_SIGNATURE.to_le_bytes());

    let dir_count = 16;
    write_struct(
        &mut file,
        &FileHeader {
            machine: MACHINE_AMD64,
            number_of_sections: 2,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: (std::mem::size_of::<OptionalHeader64>()
                + dir_count * std::mem::size_of::<DataDirectory>())
                as u16,
            characteristics: 0x22,
        },
    );
    write_struct(
        &mut file,
        &OptionalHeader64 {
            magic: OPTIONAL_HDR64_MAGIC,
            major_linker_version: 14,
            minor_linker_version: 0,
            size_of_code: SECTION_RAW_SIZE as u32,
            size_of_initialized_data: SECTION_RAW_SIZE as u32,
            size_of_uninitialized_data: 0,
            address_of_entry_point: TEXT_RVA,
            base_of_code: TEXT_RVA,
            image_base: 0x1_4000_0000,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            major_operating_system_version: 6,
            minor_operating_system_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 6,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            size_of_image: SIZE_OF_IMAGE,
            size_of_headers: HEADERS_SIZE as u32,
            check_sum: 0,
            subsystem: 3,
            dll_characteristics: 0,
            size_of_stack_reserve: 0x10_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x10_0000,
            size_of_heap_commit: 0x1000,
            loader_flags: 0,
            number_of_rva_and_sizes: dir_count as u32,
        },
    );
    for i in 0..dir_count {
        let dir = if i == DIRECTORY_ENTRY_IMPORT {
            DataDirectory {
                virtual_address: IDATA_RVA,
                size: 2 * std::mem::size_of::<ImportDescriptor>() as u32,
            }
        } else {
            DataDirectory::default()
        };
        write_struct(&mut file, &dir);
    }
    write_struct(
        &mut file,
        &section(
            ".text",
            TEXT_RVA,
            TEXT_RAW,
            IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
        ),
    );
    write_struct(
        &mut file,
        &section(
            ".idata",
            IDATA_RVA,
            IDATA_RAW,
            IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
        ),
    );
    file.resize(IDATA_RAW + SECTION_RAW_SIZE, 0);

    place(&mut file, OUTPUT_RVA, &output_code());
    place(&mut file, SUM_RVA, &SUM);
    place(&mut file, COUNT_RVA, &COUNT);
    place(&mut file, RAW_RVA, &RAW);
    place(&mut file, HELPER_RVA, &[0xC3]);

    // Import directory: one descriptor plus terminator
    let descriptor = ImportDescriptor {
        original_first_thunk: IDATA_RVA + 0x40,
        time_date_stamp: 0,
        forwarder_chain: 0,
        name: IDATA_RVA + 0x80,
        first_thunk: IAT_SLOT,
    };
    let mut idata = Vec::new();
    write_struct(&mut idata, &descriptor);
    put(&mut file, IDATA_RVA, &idata);

    let hint_name = u64::from(IDATA_RVA + 0x90);
    put(&mut file, IDATA_RVA + 0x40, &hint_name.to_le_bytes());
    put(&mut file, IAT_SLOT, &hint_name.to_le_bytes());
    put(&mut file, IDATA_RVA + 0x80, b"kernel32.dll\0");
    put(&mut file, IDATA_RVA + 0x92, b"VirtualAlloc\0");

    file
}

fn listing() -> SymbolListing {
    let text = format!(
        "# rva length name\n\
         {:x} {} Console:__CODE__Output\n\
         {:x} {} Math:__CODE__Add_sum\n\
         {:x} {} Math:__CODE__Loop_count\n\
         {:x} {} Net:__CODE__Send_raw\n\
         {:x} 1 helper\n\
         1200 0x5000 Broken:__CODE__tail\n",
        OUTPUT_RVA,
        output_code().len(),
        SUM_RVA,
        SUM.len(),
        COUNT_RVA,
        COUNT.len(),
        RAW_RVA,
        RAW.len(),
        HELPER_RVA,
    );
    SymbolListing::parse(&text).unwrap()
}

fn run(settings: ObfuscatorSettings, seed: u64) -> shellcarve::BatchReport {
    let mut pipeline = Pipeline::new(PipelineConfig {
        obfuscation: settings,
        seed: Some(seed),
        ..Default::default()
    });
    pipeline.run(&build_image(), &listing()).unwrap()
}

fn find<'a>(functions: &'a [Function], name: &str) -> &'a Function {
    functions
        .iter()
        .find(|f| f.name == name)
        .unwrap_or_else(|| panic!("function {} missing", name))
}

/// Decode `code` completely, failing on any undecodable byte.
fn decode_all(code: &[u8]) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut out = Vec::new();
    let mut instr = Instruction::default();
    while decoder.can_decode() {
        decoder.decode_out(&mut instr);
        assert!(!instr.is_invalid(), "invalid instruction at {:#x}", instr.ip());
        out.push(instr);
    }
    out
}

fn all_settings() -> ObfuscatorSettings {
    ObfuscatorSettings {
        mba_obfuscation: true,
        mba_depth: 2,
        ..Default::default()
    }
}

#[test]
fn test_image_imports() {
    let image = MappedImage::from_file_bytes(&build_image()).unwrap();
    let table = ImportTable::from_image(&image).unwrap();
    assert_eq!(table.len(), 1);
    let name = table.lookup(IAT_SLOT).unwrap();
    assert_eq!(name.module, "kernel32.dll");
    assert_eq!(name.function, "VirtualAlloc");
}

#[test]
fn test_crafted_thunks_are_skipped() {
    let mut file = build_image();
    // Hint/name RVA at the top of the address space
    put(&mut file, IDATA_RVA + 0x40, &0xFFFF_FFFFu64.to_le_bytes());
    let image = MappedImage::from_file_bytes(&file).unwrap();
    let table = ImportTable::from_image(&image).unwrap();
    assert!(table.is_empty());

    // Lookup table starting just below 4 GiB
    let mut file = build_image();
    put(&mut file, IDATA_RVA, &0xFFFF_FFF8u32.to_le_bytes());
    let image = MappedImage::from_file_bytes(&file).unwrap();
    let table = ImportTable::from_image(&image).unwrap();
    assert!(table.is_empty());
}

#[test]
fn test_disabled_pipeline_output() {
    let report = run(ObfuscatorSettings::disabled(), 1);

    assert_eq!(report.functions.len(), 4);
    let names: Vec<_> = report.functions.iter().map(|f| f.qualified_name()).collect();
    assert_eq!(
        names,
        vec!["Console::Output", "Math::sum", "Math::count", "Net::raw"]
    );

    let output = find(&report.functions, "Output");
    let mut expected = vec![0x48, 0x83, 0xEC, 0x28, 0xB9, 0, 0, 0, 0, 0x48, 0xB8];
    expected.extend([0; 8]);
    expected.extend([0xFF, 0xD0, 0x85, 0xC0, 0x74, 0x02, 0x31, 0xC0]);
    expected.extend([0x48, 0x83, 0xC4, 0x28, 0xC3]);
    assert_eq!(output.bytes, expected);

    assert_eq!(output.variables.len(), 1);
    assert_eq!(output.variables[0].width, VariableWidth::Dword);
    assert_eq!(output.variables[0].offset, 5);
    assert_eq!(output.variables[0].slot, 1);

    assert_eq!(output.dynamic_imports.len(), 1);
    assert_eq!(output.dynamic_imports[0].module, "kernel32.dll");
    assert_eq!(output.dynamic_imports[0].function, "VirtualAlloc");
    assert_eq!(output.dynamic_imports[0].offset, 11);

    assert_eq!(find(&report.functions, "sum").bytes, SUM);
    assert_eq!(find(&report.functions, "count").bytes, COUNT);
    assert_eq!(find(&report.functions, "raw").bytes, RAW);
}

#[test]
fn test_exclusions_and_diagnostics() {
    let report = run(ObfuscatorSettings::disabled(), 1);

    assert_eq!(report.excluded.len(), 1);
    assert_eq!(report.excluded[0].name, "Broken:__CODE__tail");
    assert_eq!(report.excluded[0].stage, "extract");

    assert_eq!(report.diagnostics.len(), 1);
    let diagnostic = &report.diagnostics[0];
    assert_eq!(diagnostic.function, "Net::raw");
    assert!(matches!(
        diagnostic.kind,
        DiagnosticKind::UnresolvedImport { offset: 0, .. }
    ));
}

#[test]
fn test_obfuscated_output_properties() {
    for seed in 0..24 {
        let report = run(all_settings(), seed);
        assert_eq!(report.functions.len(), 4, "seed {}", seed);

        for function in &report.functions {
            // Output must decode cleanly and end where the code ends
            let instrs = decode_all(&function.bytes);
            let last = instrs.last().unwrap();
            assert_eq!(last.next_ip() as usize, function.bytes.len());

            for var in &function.variables {
                let at = var.offset as usize;
                assert!(at + var.width.bytes() <= function.bytes.len());
                assert!(function.bytes[at..at + var.width.bytes()].iter().all(|&b| b == 0));
            }
            for import in &function.dynamic_imports {
                let at = import.offset as usize;
                assert_eq!(&function.bytes[at - 2..at], &[0x48, 0xB8]);
                assert_eq!(&function.bytes[at..at + 8], &[0; 8]);
            }
        }

        let output = find(&report.functions, "Output");
        assert_eq!(output.variables.len(), 1, "seed {}", seed);
        assert_eq!(output.dynamic_imports.len(), 1, "seed {}", seed);
    }
}

#[test]
fn test_seeded_runs_are_reproducible() {
    let a = run(all_settings(), 42);
    let b = run(all_settings(), 42);
    for (fa, fb) in a.functions.iter().zip(&b.functions) {
        assert_eq!(fa.bytes, fb.bytes);
        assert_eq!(fa.variables, fb.variables);
        assert_eq!(fa.dynamic_imports, fb.dynamic_imports);
    }
}

#[test]
fn test_no_symbols_found() {
    let mut pipeline = Pipeline::new(PipelineConfig {
        search_term: "__NOPE__".into(),
        ..Default::default()
    });
    let err = pipeline.run(&build_image(), &listing()).unwrap_err();
    assert!(matches!(err, Error::NoSymbolsFound { .. }));
}

#[test]
fn test_bad_images() {
    let mut pipeline = Pipeline::new(PipelineConfig::default());

    let mut image = build_image();
    image[0] = b'X';
    let err = pipeline.run(&image, &listing()).unwrap_err();
    assert!(err.is_image_format());

    let mut image = build_image();
    let machine_at = PE_OFFSET as usize + 4;
    image[machine_at..machine_at + 2].copy_from_slice(&0x14Cu16.to_le_bytes());
    let err = pipeline.run(&image, &listing()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedMachine(0x14C)));
}

#[test]
fn test_progress_reporting() {
    let stages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&stages);
    let mut pipeline = Pipeline::new(PipelineConfig {
        seed: Some(3),
        progress_callback: Some(Box::new(move |info: &ProgressInfo| {
            sink.lock().unwrap().push(info.stage);
        })),
        ..Default::default()
    });
    pipeline.run(&build_image(), &listing()).unwrap();

    let stages = stages.lock().unwrap();
    assert_eq!(stages.first(), Some(&ProgressStage::Initializing));
    assert_eq!(stages.last(), Some(&ProgressStage::Complete));
    assert!(stages.contains(&ProgressStage::Obfuscating));
}

#[test]
fn test_headers_written_per_group() {
    let report = run(all_settings(), 9);
    let dir = std::env::temp_dir().join(format!("shellcarve-it-{}", std::process::id()));

    let written = OutputWriter::new(&dir).write(&report.functions).unwrap();
    let names: Vec<_> = written
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["Console.h", "Math.h", "Net.h"]);

    let console = std::fs::read_to_string(dir.join("Console.h")).unwrap();
    assert!(console.contains("Console_Output_code"));
    assert!(console.contains("\"kernel32.dll\", \"VirtualAlloc\""));
    let math = std::fs::read_to_string(dir.join("Math.h")).unwrap();
    assert!(math.contains("Math_sum_code"));
    assert!(math.contains("Math_count_code"));

    std::fs::remove_dir_all(&dir).unwrap();
}
