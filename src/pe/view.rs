//! Read-only view over a serialized PE32+ image
//!
//! Parses the headers back with [`ByteReader`] and resolves RVAs to file
//! offsets the way the loader maps sections. Used by `minpe inspect` and by
//! the tests to check that every cross-reference lands where it claims to.

use crate::binary::ByteReader;
use crate::error::{PeError, Result};

use super::consts;
use super::headers::{CoffHeader, DosHeader, OptionalHeader, SectionHeader};

/// One DLL's worth of imports as read back from an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedDll {
    pub dll: String,
    /// (hint, name) in lookup table order
    pub functions: Vec<(u16, String)>,
    pub iat_rva: u32,
}

#[derive(Debug, Clone)]
pub struct ImageView<'a> {
    data: &'a [u8],
    pub dos: DosHeader,
    pub coff: CoffHeader,
    pub optional: OptionalHeader,
    pub sections: Vec<SectionHeader>,
    optional_header_offset: usize,
    optional_header_len: usize,
}

impl<'a> ImageView<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);

        let dos = DosHeader::read(&mut r)?;
        if dos.e_magic != consts::DOS_MAGIC {
            return Err(PeError::BadSignature("DOS"));
        }

        r.seek(dos.e_lfanew as usize);
        if r.array::<{ consts::PE_SIGNATURE_SIZE }>()? != consts::PE_SIGNATURE {
            return Err(PeError::BadSignature("PE"));
        }

        let coff = CoffHeader::read(&mut r)?;

        let optional_header_offset = r.position();
        let optional = OptionalHeader::read(&mut r)?;
        if optional.magic != consts::PE32_PLUS_MAGIC {
            return Err(PeError::BadSignature("PE32+ optional header"));
        }
        let optional_header_len = r.position() - optional_header_offset;

        // The section table follows the optional header at the declared size
        r.seek(optional_header_offset + coff.size_of_optional_header as usize);
        let sections = (0..coff.number_of_sections)
            .map(|_| SectionHeader::read(&mut r))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            data,
            dos,
            coff,
            optional,
            sections,
            optional_header_offset,
            optional_header_len,
        })
    }

    pub fn optional_header_offset(&self) -> usize {
        self.optional_header_offset
    }

    /// Bytes actually occupied by the optional header encoding
    pub fn optional_header_len(&self) -> usize {
        self.optional_header_len
    }

    pub fn section(&self, name: &str) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.name_str() == name)
    }

    pub fn section_for_rva(&self, rva: u32) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// File offset backing `rva`, if it lies in a section's raw data
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        let s = self.section_for_rva(rva)?;
        let delta = rva - s.virtual_address;
        if delta >= s.size_of_raw_data {
            return None;
        }
        Some(s.pointer_to_raw_data as usize + delta as usize)
    }

    fn reader_at_rva(&self, rva: u32, what: &str) -> Result<ByteReader<'a>> {
        let offset = self.rva_to_offset(rva).ok_or_else(|| {
            PeError::MalformedImportTable(format!("{} RVA {:#x} is not backed by file data", what, rva))
        })?;
        Ok(ByteReader::at(self.data, offset))
    }

    /// Walk the import directory
    pub fn imports(&self) -> Result<Vec<ImportedDll>> {
        let dir = self.optional.data_directories[consts::IMAGE_DIRECTORY_ENTRY_IMPORT];
        if dir.is_empty() {
            return Ok(Vec::new());
        }

        let mut descriptors = self.reader_at_rva(dir.virtual_address, "import directory")?;
        let mut out = Vec::new();
        loop {
            let original_first_thunk = descriptors.u32()?;
            descriptors.skip(8)?; // TimeDateStamp, ForwarderChain
            let name = descriptors.u32()?;
            let first_thunk = descriptors.u32()?;
            if original_first_thunk == 0 && name == 0 && first_thunk == 0 {
                break;
            }

            let dll = self.reader_at_rva(name, "DLL name")?.cstr()?;
            let lookup = if original_first_thunk != 0 {
                original_first_thunk
            } else {
                first_thunk
            };

            let mut thunks = self.reader_at_rva(lookup, "lookup table")?;
            let mut functions = Vec::new();
            loop {
                let entry = thunks.u64()?;
                if entry == 0 {
                    break;
                }
                if entry & consts::IMPORT_BY_ORDINAL_FLAG != 0 {
                    functions.push(((entry & 0xFFFF) as u16, String::new()));
                    continue;
                }
                let mut hint_name = self.reader_at_rva(entry as u32, "hint/name")?;
                let hint = hint_name.u16()?;
                let func = hint_name.cstr()?;
                functions.push((hint, String::from_utf8_lossy(func).into_owned()));
            }

            out.push(ImportedDll {
                dll: String::from_utf8_lossy(dll).into_owned(),
                functions,
                iat_rva: first_thunk,
            });
        }
        Ok(out)
    }
}
