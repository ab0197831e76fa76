//! PE32+ Image Builder
//!
//! Assembles DOS header and stub, COFF header, optional header, section
//! table and section contents into one byte stream. All header fields that
//! describe other parts of the file are taken from the computed
//! [`ImageLayout`], never from constants.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::binary::ByteWriter;
use crate::error::{PeError, Result};

use super::consts;
use super::headers::{CoffHeader, DataDirectory, DosHeader, OptionalHeader, SectionHeader};
use super::import::{self, build_import_table};
use super::layout::{check_alignments, ImageLayout, SectionRequest};

/// Image base must sit on a 64K boundary
const IMAGE_BASE_ALIGNMENT: u64 = 0x10000;

/// Tunable Optional Header fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub major_os_version: u16,
    pub minor_os_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        let h = OptionalHeader::default();
        Self {
            image_base: h.image_base,
            section_alignment: h.section_alignment,
            file_alignment: h.file_alignment,
            major_linker_version: h.major_linker_version,
            minor_linker_version: h.minor_linker_version,
            major_os_version: h.major_os_version,
            minor_os_version: h.minor_os_version,
            major_image_version: h.major_image_version,
            minor_image_version: h.minor_image_version,
            major_subsystem_version: h.major_subsystem_version,
            minor_subsystem_version: h.minor_subsystem_version,
            subsystem: h.subsystem,
            dll_characteristics: h.dll_characteristics,
            size_of_stack_reserve: h.size_of_stack_reserve,
            size_of_stack_commit: h.size_of_stack_commit,
            size_of_heap_reserve: h.size_of_heap_reserve,
            size_of_heap_commit: h.size_of_heap_commit,
        }
    }
}

impl ImageConfig {
    pub fn validate(&self) -> Result<()> {
        check_alignments(self.section_alignment, self.file_alignment)?;
        if self.image_base % IMAGE_BASE_ALIGNMENT != 0 {
            return Err(PeError::AlignmentViolation {
                what: "image base",
                value: self.image_base,
                alignment: IMAGE_BASE_ALIGNMENT,
            });
        }
        Ok(())
    }

    /// Optional header carrying this configuration; layout-dependent fields are zero
    fn optional_header(&self) -> OptionalHeader {
        OptionalHeader {
            major_linker_version: self.major_linker_version,
            minor_linker_version: self.minor_linker_version,
            image_base: self.image_base,
            section_alignment: self.section_alignment,
            file_alignment: self.file_alignment,
            major_os_version: self.major_os_version,
            minor_os_version: self.minor_os_version,
            major_image_version: self.major_image_version,
            minor_image_version: self.minor_image_version,
            major_subsystem_version: self.major_subsystem_version,
            minor_subsystem_version: self.minor_subsystem_version,
            subsystem: self.subsystem,
            dll_characteristics: self.dll_characteristics,
            size_of_stack_reserve: self.size_of_stack_reserve,
            size_of_stack_commit: self.size_of_stack_commit,
            size_of_heap_reserve: self.size_of_heap_reserve,
            size_of_heap_commit: self.size_of_heap_commit,
            ..OptionalHeader::default()
        }
    }
}

/// A section and its contents
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub characteristics: u32,
    pub data: Vec<u8>,
    /// Required RVA; placed after the previous section when `None`
    pub virtual_address: Option<u32>,
}

impl Section {
    pub fn new(name: &str, characteristics: u32, data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            characteristics,
            data,
            virtual_address: None,
        }
    }

    /// Pin the section at `rva`
    pub fn at(mut self, rva: u32) -> Self {
        self.virtual_address = Some(rva);
        self
    }
}

fn validate_section_name(name: &str) -> Result<()> {
    if name.is_empty() || name.bytes().any(|b| b == 0) {
        return Err(PeError::InvalidIdentifier {
            name: name.to_string(),
            reason: "section names must be non-empty and NUL-free",
        });
    }
    if name.len() > consts::SECTION_NAME_SIZE {
        return Err(PeError::NameTooLong {
            name: name.to_string(),
            len: name.len(),
            max: consts::SECTION_NAME_SIZE,
        });
    }
    Ok(())
}

/// PE32+ executable builder for Windows x64
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    config: ImageConfig,
    sections: Vec<Section>,
    entry: Option<(usize, u32)>,
    directories: Vec<(usize, DataDirectory)>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ImageConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Set the image base address
    pub fn image_base(mut self, addr: u64) -> Self {
        self.config.image_base = addr;
        self
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Append a section. Sections are placed in the order they are added.
    pub fn section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    /// Start execution at `offset` bytes into section number `section`
    pub fn entry_point(mut self, section: usize, offset: u32) -> Self {
        self.entry = Some((section, offset));
        self
    }

    /// Set data directory `index`
    pub fn data_directory(mut self, index: usize, directory: DataDirectory) -> Self {
        self.directories.push((index, directory));
        self
    }

    /// Code, import table and directories of a console executable whose
    /// import table is mapped at `import_table_rva`
    pub fn for_executable(
        config: ImageConfig,
        code: &[u8],
        import_table_rva: u32,
        import_table: &[u8],
    ) -> Result<Self> {
        let (import_dir, iat_dir) = import::locate_directories(import_table, import_table_rva)?;

        Ok(Self::with_config(config)
            .section(Section::new(
                ".text",
                consts::TEXT_CHARACTERISTICS,
                code.to_vec(),
            ))
            .section(
                Section::new(
                    ".idata",
                    consts::IDATA_CHARACTERISTICS,
                    import_table.to_vec(),
                )
                .at(import_table_rva),
            )
            .entry_point(0, 0)
            .data_directory(consts::IMAGE_DIRECTORY_ENTRY_IMPORT, import_dir)
            .data_directory(consts::IMAGE_DIRECTORY_ENTRY_IAT, iat_dir))
    }

    /// Compute where every header and section goes
    pub fn layout(&self) -> Result<ImageLayout> {
        self.config.validate()?;
        for s in &self.sections {
            validate_section_name(&s.name)?;
        }
        if let Some(&(index, _)) = self
            .directories
            .iter()
            .find(|(index, _)| *index >= consts::DATA_DIRECTORY_COUNT)
        {
            return Err(PeError::InvalidDataDirectory {
                index,
                count: consts::DATA_DIRECTORY_COUNT,
            });
        }

        let optional_header_size = self.config.optional_header().to_bytes().len();
        let optional_header_size =
            u16::try_from(optional_header_size).map_err(|_| PeError::OversizedSection {
                name: "optional header".to_string(),
                size: optional_header_size as u64,
            })?;

        let requests: Vec<SectionRequest<'_>> = self
            .sections
            .iter()
            .map(|s| SectionRequest {
                name: &s.name,
                len: s.data.len(),
                pinned_rva: s.virtual_address,
                characteristics: s.characteristics,
            })
            .collect();

        ImageLayout::plan(
            self.config.section_alignment,
            self.config.file_alignment,
            DosHeader::pe_header_offset() as u32,
            optional_header_size,
            &requests,
        )
    }

    fn entry_rva(&self, layout: &ImageLayout) -> Result<u32> {
        let Some((index, offset)) = self.entry else {
            return Ok(0);
        };
        let placement = layout.sections.get(index).ok_or_else(|| {
            PeError::InvalidEntryPoint(format!(
                "section {} does not exist ({} sections)",
                index,
                layout.sections.len()
            ))
        })?;
        if offset > placement.virtual_size {
            return Err(PeError::InvalidEntryPoint(format!(
                "offset {:#x} is past the end of {} ({:#x} bytes)",
                offset, placement.name, placement.virtual_size
            )));
        }
        Ok(placement.virtual_address + offset)
    }

    /// Build the complete PE file
    pub fn build(&self) -> Result<Vec<u8>> {
        let layout = self.layout()?;
        let num_sections =
            u16::try_from(layout.sections.len()).map_err(|_| PeError::OversizedSection {
                name: "section table".to_string(),
                size: layout.sections.len() as u64,
            })?;

        let mut optional_header = self.config.optional_header();
        optional_header.address_of_entry_point = self.entry_rva(&layout)?;
        optional_header.size_of_image = layout.size_of_image;
        optional_header.size_of_headers = layout.size_of_headers;
        optional_header.base_of_code = layout
            .sections
            .iter()
            .find(|s| s.characteristics & consts::IMAGE_SCN_CNT_CODE != 0)
            .map_or(0, |s| s.virtual_address);
        // Layout sizes all fit in u32, so these sums cannot exceed SizeOfImage
        for s in &layout.sections {
            if s.characteristics & consts::IMAGE_SCN_CNT_CODE != 0 {
                optional_header.size_of_code += s.virtual_size;
            }
            if s.characteristics & consts::IMAGE_SCN_CNT_INITIALIZED_DATA != 0 {
                optional_header.size_of_initialized_data += s.virtual_size;
            }
        }
        for &(index, directory) in &self.directories {
            let slot = optional_header.data_directories.get_mut(index).ok_or(
                PeError::InvalidDataDirectory {
                    index,
                    count: consts::DATA_DIRECTORY_COUNT,
                },
            )?;
            *slot = directory;
        }

        let optional_bytes = optional_header.to_bytes();
        debug_assert_eq!(optional_bytes.len(), layout.optional_header_size as usize);
        let coff_header = CoffHeader::new(num_sections, optional_bytes.len() as u16);

        debug!(
            "entry {:#x}, SizeOfCode {:#x}, SizeOfInitializedData {:#x}",
            optional_header.address_of_entry_point,
            optional_header.size_of_code,
            optional_header.size_of_initialized_data
        );

        let mut w = ByteWriter::with_capacity(layout.file_size());
        DosHeader::with_lfanew(layout.e_lfanew).write_with_stub(&mut w);
        w.bytes(&consts::PE_SIGNATURE);
        coff_header.write(&mut w);
        w.bytes(&optional_bytes);

        for p in &layout.sections {
            let mut header = SectionHeader::new(&p.name, p.characteristics);
            header.virtual_size = p.virtual_size;
            header.virtual_address = p.virtual_address;
            header.size_of_raw_data = p.size_of_raw_data;
            header.pointer_to_raw_data = p.pointer_to_raw_data;
            header.write(&mut w);
        }
        debug_assert_eq!(w.position(), layout.headers_len as usize);
        w.pad_to(layout.size_of_headers as usize);

        // Raw data in file order; `plan` hands out pointers in section order
        for (p, s) in layout.sections.iter().zip(&self.sections) {
            if p.size_of_raw_data == 0 {
                continue;
            }
            let start = p.pointer_to_raw_data as usize;
            w.pad_to(start);
            w.bytes(&s.data);
            w.pad_to(start + p.size_of_raw_data as usize);
        }

        let image = w.into_bytes();
        info!(
            "built PE32+ image: {} sections, {:#x} bytes, SizeOfImage {:#x}",
            num_sections,
            image.len(),
            layout.size_of_image
        );
        Ok(image)
    }
}

/// Build a console executable with the default configuration from `code`
/// and an import table built for `import_table_rva`
pub fn build_image(code: &[u8], import_table_rva: u32, import_table: &[u8]) -> Result<Vec<u8>> {
    ImageBuilder::for_executable(ImageConfig::default(), code, import_table_rva, import_table)?
        .build()
}

/// Build a console executable importing `function` from `dll`. The import
/// table goes at the first section-aligned RVA after the code.
pub fn build_console_executable(
    code: &[u8],
    config: &ImageConfig,
    dll: &str,
    function: &str,
) -> Result<Vec<u8>> {
    let import_table_rva = import_table_rva_after(code.len(), config)?;
    let import_table = build_import_table(import_table_rva, dll, function)?;
    ImageBuilder::for_executable(config.clone(), code, import_table_rva, &import_table)?.build()
}

/// First RVA available to a section following `code_len` bytes of code
pub fn import_table_rva_after(code_len: usize, config: &ImageConfig) -> Result<u32> {
    let probe = ImageBuilder::with_config(config.clone())
        .section(Section::new(
            ".text",
            consts::TEXT_CHARACTERISTICS,
            vec![0; code_len],
        ))
        .section(Section::new(".idata", consts::IDATA_CHARACTERISTICS, Vec::new()))
        .layout()?;
    Ok(probe.sections[1].virtual_address)
}
