//! Integration tests for minpe
//!
//! Builds complete images through the public API and checks every header
//! cross-reference against the bytes that were actually written.

use minpe::pe::{consts, import_table_rva_after, ImageView, SectionHeader};
use minpe::{
    build_console_executable, build_image, build_import_table, ImageConfig, ImportTableBuilder,
    PeError,
};

/// mov eax, 4; imul rax, rax, 3; add rax, 2; ret
const ARITHMETIC: [u8; 14] = [
    0xB8, 0x04, 0x00, 0x00, 0x00, 0x48, 0x6B, 0xC0, 0x03, 0x48, 0x83, 0xC0, 0x02, 0xC3,
];

fn build(code: &[u8]) -> Vec<u8> {
    build_console_executable(code, &ImageConfig::default(), "kernel32.dll", "ExitProcess")
        .expect("image build failed")
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

/// `rva - section.virtual_address + section.pointer_to_raw_data` for the section holding `rva`
fn file_offset(sections: &[SectionHeader], rva: u32) -> usize {
    let s = sections
        .iter()
        .find(|s| rva >= s.virtual_address && rva < s.virtual_address + s.size_of_raw_data)
        .unwrap_or_else(|| panic!("RVA {:#x} is not inside any section", rva));
    (rva - s.virtual_address + s.pointer_to_raw_data) as usize
}

#[test]
fn test_arithmetic_scenario() {
    let idata = build_import_table(0x2000, "kernel32.dll", "ExitProcess").unwrap();
    let pe = build_image(&ARITHMETIC, 0x2000, &idata).unwrap();
    let view = ImageView::parse(&pe).unwrap();

    assert_eq!(view.coff.number_of_sections, 2);
    assert_eq!(view.optional.address_of_entry_point, 0x1000);

    let text = &view.sections[0];
    assert_eq!(text.name_str(), ".text");
    assert_eq!(text.virtual_address, 0x1000);
    assert_eq!(text.virtual_size, 14);

    let idata_section = &view.sections[1];
    assert_eq!(idata_section.name_str(), ".idata");
    assert_eq!(idata_section.virtual_address, 0x2000);

    // Follow the import directory to the hint/name entry of ExitProcess
    let dir_off = file_offset(&view.sections, 0x2000);
    let ilt_rva = u32_at(&pe, dir_off);
    let hint_name_rva = u64_at(&pe, file_offset(&view.sections, ilt_rva)) as u32;
    let hint_name_off = file_offset(&view.sections, hint_name_rva);
    assert_eq!(&pe[hint_name_off..hint_name_off + 2], &[0, 0]);
    assert_eq!(&pe[hint_name_off + 2..hint_name_off + 14], b"ExitProcess\0");

    // Code is where the entry point says
    let entry_off = file_offset(&view.sections, view.optional.address_of_entry_point);
    assert_eq!(&pe[entry_off..entry_off + 14], &ARITHMETIC);
}

#[test]
fn test_optional_header_size_is_self_consistent() {
    for code in [&[][..], &ARITHMETIC[..], &[0x90; 0x1234][..]] {
        let pe = build(code);
        let view = ImageView::parse(&pe).unwrap();
        assert_eq!(
            view.coff.size_of_optional_header as usize,
            view.optional_header_len()
        );
        assert_eq!(view.optional.number_of_rva_and_sizes, 16);

        // The section table starts right where the optional header ends
        let table = view.optional_header_offset() + view.optional_header_len();
        assert_eq!(&pe[table..table + 8], b".text\0\0\0");
    }
}

#[test]
fn test_pe_signature_at_lfanew() {
    let pe = build(&ARITHMETIC);
    let e_lfanew = u32_at(&pe, 0x3C) as usize;
    assert_eq!(&pe[e_lfanew..e_lfanew + 4], &[b'P', b'E', 0, 0]);
    assert_eq!(&pe[0..2], b"MZ");
}

#[test]
fn test_import_rvas_resolve_to_their_structures() {
    let pe = build(&ARITHMETIC);
    let view = ImageView::parse(&pe).unwrap();
    let sections = &view.sections;

    let import_dir = view.optional.data_directories[consts::IMAGE_DIRECTORY_ENTRY_IMPORT];
    let iat_dir = view.optional.data_directories[consts::IMAGE_DIRECTORY_ENTRY_IAT];
    assert_eq!(import_dir.size, 40);

    let d = file_offset(sections, import_dir.virtual_address);
    let original_first_thunk = u32_at(&pe, d);
    let name = u32_at(&pe, d + 12);
    let first_thunk = u32_at(&pe, d + 16);
    assert!(pe[d + 20..d + 40].iter().all(|&b| b == 0));
    assert_eq!(first_thunk, iat_dir.virtual_address);

    let name_off = file_offset(sections, name);
    assert_eq!(&pe[name_off..name_off + 13], b"kernel32.dll\0");

    for thunk_rva in [original_first_thunk, first_thunk] {
        let t = file_offset(sections, thunk_rva);
        let hint_name = u64_at(&pe, t);
        assert_eq!(u64_at(&pe, t + 8), 0);
        let h = file_offset(sections, hint_name as u32);
        assert_eq!(&pe[h + 2..h + 14], b"ExitProcess\0");
    }

    // The lookup and address tables are distinct arrays
    assert_ne!(original_first_thunk, first_thunk);
}

#[test]
fn test_import_offsets_follow_encoded_sizes() {
    // Sub-structures are packed back to back from their real sizes rather than
    // parked at fixed 0x100/0x200/0x300 offsets from the base
    let base = 0x2000;
    let blob = build_import_table(base, "kernel32.dll", "ExitProcess").unwrap();
    let ilt = u32_at(&blob, 0) - base;
    let name = u32_at(&blob, 12) - base;
    let iat = u32_at(&blob, 16) - base;
    let hint_name = u64_at(&blob, ilt as usize) as u32 - base;

    assert_eq!(ilt, 2 * 20);
    assert_eq!(iat, ilt + 2 * 8);
    assert_eq!(name, iat + 2 * 8);
    assert_eq!(hint_name, name + 14);
    assert!(((hint_name + 2 + 12) as usize) <= consts::IMPORT_BLOCK_SIZE);

    // Longer names push later structures along instead of colliding
    let table = ImportTableBuilder::new(base)
        .import("a_rather_long_library_name_for_testing.dll", "SomeExceptionallyLongFunctionName")
        .import("a_rather_long_library_name_for_testing.dll", "Another")
        .build()
        .unwrap();
    let pe = build_image(&ARITHMETIC, base, table.bytes()).unwrap();
    let imports = ImageView::parse(&pe).unwrap().imports().unwrap();
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].dll, "a_rather_long_library_name_for_testing.dll");
    assert_eq!(
        imports[0].functions,
        vec![
            (0, "SomeExceptionallyLongFunctionName".to_string()),
            (0, "Another".to_string())
        ]
    );
}

#[test]
fn test_alignment_and_no_overlap() {
    for len in [0usize, 1, 14, 0x1FF, 0x200, 0x1001, 0x3456] {
        let pe = build(&vec![0xCC; len]);
        let view = ImageView::parse(&pe).unwrap();
        let sa = view.optional.section_alignment;
        let fa = view.optional.file_alignment;

        assert_eq!(view.optional.size_of_headers % fa, 0);
        assert_eq!(view.optional.size_of_image % sa, 0);

        for s in &view.sections {
            assert_eq!(s.virtual_address % sa, 0, "{} len {}", s.name_str(), len);
            assert_eq!(s.pointer_to_raw_data % fa, 0, "{} len {}", s.name_str(), len);
            assert_eq!(s.size_of_raw_data % fa, 0, "{} len {}", s.name_str(), len);
        }

        for (i, a) in view.sections.iter().enumerate() {
            for b in view.sections.iter().skip(i + 1) {
                let a_end = a.pointer_to_raw_data + a.size_of_raw_data;
                let b_end = b.pointer_to_raw_data + b.size_of_raw_data;
                if a.size_of_raw_data > 0 && b.size_of_raw_data > 0 {
                    assert!(a_end <= b.pointer_to_raw_data || b_end <= a.pointer_to_raw_data);
                }
                assert!(b.virtual_address > a.virtual_address);
            }
        }

        let last = view.sections.last().unwrap();
        assert_eq!(pe.len(), (last.pointer_to_raw_data + last.size_of_raw_data) as usize);
    }
}

#[test]
fn test_header_sizes() {
    let pe = build(&ARITHMETIC);
    let view = ImageView::parse(&pe).unwrap();
    assert_eq!(view.optional.size_of_headers, 0x200);
    assert_eq!(view.optional.size_of_image, 0x3000);
    assert_eq!(view.optional.size_of_code, 14);
    assert_eq!(view.optional.size_of_initialized_data, 512);
    assert_eq!(view.optional.base_of_code, 0x1000);
    assert_eq!(view.optional.subsystem, consts::IMAGE_SUBSYSTEM_WINDOWS_CUI);
    assert_eq!(view.optional.magic, consts::PE32_PLUS_MAGIC);
    assert_eq!(view.coff.machine, consts::IMAGE_FILE_MACHINE_AMD64);
    assert_ne!(view.coff.characteristics & consts::IMAGE_FILE_EXECUTABLE_IMAGE, 0);
    assert_ne!(view.coff.characteristics & consts::IMAGE_FILE_RELOCS_STRIPPED, 0);
}

#[test]
fn test_deterministic_output() {
    let a = build(&ARITHMETIC);
    let b = build(&ARITHMETIC);
    assert_eq!(a, b);
}

#[test]
fn test_empty_code_still_valid() {
    let pe = build(&[]);
    let view = ImageView::parse(&pe).unwrap();
    assert_eq!(view.coff.number_of_sections, 2);

    let text = view.section(".text").unwrap();
    assert_eq!(text.virtual_size, 0);
    assert_eq!(text.size_of_raw_data, 0);
    assert_eq!(text.virtual_address, 0x1000);
    assert_eq!(view.optional.size_of_code, 0);

    let idata = view.section(".idata").unwrap();
    assert_eq!(idata.virtual_address, 0x2000);
    assert_eq!(idata.pointer_to_raw_data, 0x200);

    let imports = view.imports().unwrap();
    assert_eq!(imports[0].functions[0].1, "ExitProcess");
}

#[test]
fn test_import_table_in_the_wrong_place() {
    // Code spills into the page the import table was built for
    let code = vec![0x90; 0x1001];
    let idata = build_import_table(0x2000, "kernel32.dll", "ExitProcess").unwrap();
    assert!(matches!(
        build_image(&code, 0x2000, &idata),
        Err(PeError::SectionOverlap { .. })
    ));

    // Moving it to the next free page works
    let rva = import_table_rva_after(code.len(), &ImageConfig::default()).unwrap();
    assert_eq!(rva, 0x3000);
    let idata = build_import_table(rva, "kernel32.dll", "ExitProcess").unwrap();
    assert!(build_image(&code, rva, &idata).is_ok());

    // A blob built for one RVA cannot be placed at another
    let idata = build_import_table(0x2000, "kernel32.dll", "ExitProcess").unwrap();
    assert!(matches!(
        build_image(&ARITHMETIC, 0x4000, &idata),
        Err(PeError::MalformedImportTable(_))
    ));
}

#[test]
fn test_tampered_import_table_is_never_written() {
    let idata = build_import_table(0x2000, "kernel32.dll", "ExitProcess").unwrap();
    let ilt = (u32_at(&idata, 0) - 0x2000) as usize;
    let iat = (u32_at(&idata, 16) - 0x2000) as usize;

    // Lookup entry aimed outside the section
    let mut bad = idata.clone();
    bad[ilt..ilt + 8].copy_from_slice(&0x9999u64.to_le_bytes());
    assert!(matches!(
        build_image(&ARITHMETIC, 0x2000, &bad),
        Err(PeError::MalformedImportTable(_))
    ));

    // Hint/name RVA with bits above 31 set, in either table
    for thunk in [ilt, iat] {
        let mut bad = idata.clone();
        bad[thunk + 4] = 1;
        assert!(matches!(
            build_image(&ARITHMETIC, 0x2000, &bad),
            Err(PeError::MalformedImportTable(_))
        ));
    }
}

#[test]
fn test_custom_config_round_trips() {
    let config: ImageConfig = serde_json::from_str(
        r#"{ "image_base": 4194304, "file_alignment": 4096, "subsystem": 2 }"#,
    )
    .unwrap();
    assert_eq!(config.section_alignment, 0x1000);

    let pe = build_console_executable(&ARITHMETIC, &config, "kernel32.dll", "ExitProcess").unwrap();
    let view = ImageView::parse(&pe).unwrap();
    assert_eq!(view.optional.image_base, 0x400000);
    assert_eq!(view.optional.file_alignment, 0x1000);
    assert_eq!(view.optional.size_of_headers, 0x1000);
    assert_eq!(view.optional.subsystem, consts::IMAGE_SUBSYSTEM_WINDOWS_GUI);
    assert_eq!(view.section(".text").unwrap().pointer_to_raw_data, 0x1000);
    assert_eq!(pe.len(), 0x3000);
}

#[test]
fn test_goblin_accepts_image() {
    let pe = build(&ARITHMETIC);
    let parsed = goblin::pe::PE::parse(&pe).expect("goblin rejected the image");

    assert!(parsed.is_64);
    assert_eq!(parsed.entry as u64, 0x1000);
    assert_eq!(parsed.header.coff_header.number_of_sections, 2);
    assert_eq!(parsed.header.coff_header.size_of_optional_header, 240);

    let names: Vec<&str> = parsed.sections.iter().map(|s| s.name().unwrap()).collect();
    assert_eq!(names, vec![".text", ".idata"]);

    assert_eq!(parsed.libraries, vec!["kernel32.dll"]);
    assert_eq!(parsed.imports.len(), 1);
    assert_eq!(parsed.imports[0].name, "ExitProcess");
    assert_eq!(parsed.imports[0].dll, "kernel32.dll");
}
