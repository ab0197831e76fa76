//! PE32+ Header Structures
//!
//! Field-by-field encodings of the headers that precede section data.
//! Each structure writes itself through a [`ByteWriter`] and reads itself
//! back through a [`ByteReader`], so sizes are always those of the actual
//! encoding rather than assumed constants.

use crate::binary::{ByteReader, ByteWriter};
use crate::error::Result;

use super::consts;

/// 16-bit real-mode stub that prints the message below and exits with code 1
const DOS_STUB_CODE: [u8; 14] = [
    0x0E, // push cs
    0x1F, // pop ds
    0xBA, 0x0E, 0x00, // mov dx, message
    0xB4, 0x09, // mov ah, 9
    0xCD, 0x21, // int 21h
    0xB8, 0x01, 0x4C, // mov ax, 4C01h
    0xCD, 0x21, // int 21h
];

const DOS_STUB_MESSAGE: &[u8] = b"This program cannot be run in DOS mode.\r\r\n$";

/// DOS Header (64 bytes) followed by the real-mode stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DosHeader {
    pub e_magic: u16,    // Magic number (MZ)
    pub e_cblp: u16,     // Bytes on last page
    pub e_cp: u16,       // Pages in file
    pub e_cparhdr: u16,  // Header size in paragraphs
    pub e_maxalloc: u16, // Maximum extra paragraphs
    pub e_sp: u16,       // Initial SP
    pub e_lfarlc: u16,   // Relocation table offset
    pub e_lfanew: u32,   // File address of PE header
}

impl DosHeader {
    /// Header whose `e_lfanew` points just past the stub, on an 8-byte boundary
    pub fn new() -> Self {
        Self::with_lfanew(Self::pe_header_offset() as u32)
    }

    pub fn with_lfanew(e_lfanew: u32) -> Self {
        Self {
            e_magic: consts::DOS_MAGIC,
            e_cblp: 0x90,
            e_cp: 3,
            e_cparhdr: (consts::DOS_HEADER_SIZE / 16) as u16,
            e_maxalloc: 0xFFFF,
            e_sp: 0xB8,
            e_lfarlc: consts::DOS_HEADER_SIZE as u16,
            e_lfanew,
        }
    }

    /// Length of the DOS stub program including its message
    pub fn stub_len() -> usize {
        DOS_STUB_CODE.len() + DOS_STUB_MESSAGE.len()
    }

    /// File offset of the PE signature when this header and stub lead the file
    pub fn pe_header_offset() -> usize {
        (consts::DOS_HEADER_SIZE + Self::stub_len() + 7) & !7
    }

    /// Write the 64-byte header only
    pub fn write(&self, w: &mut ByteWriter) {
        w.u16(self.e_magic);
        w.u16(self.e_cblp);
        w.u16(self.e_cp);
        w.u16(0); // e_crlc
        w.u16(self.e_cparhdr);
        w.u16(0); // e_minalloc
        w.u16(self.e_maxalloc);
        w.u16(0); // e_ss
        w.u16(self.e_sp);
        w.u16(0); // e_csum
        w.u16(0); // e_ip
        w.u16(0); // e_cs
        w.u16(self.e_lfarlc);
        w.u16(0); // e_ovno
        // e_res, e_oemid, e_oeminfo, e_res2
        w.zeros(32);
        w.u32(self.e_lfanew);
    }

    /// Write the header, the stub, and padding up to `e_lfanew`
    pub fn write_with_stub(&self, w: &mut ByteWriter) {
        let start = w.position();
        self.write(w);
        w.bytes(&DOS_STUB_CODE);
        w.bytes(DOS_STUB_MESSAGE);
        w.pad_to(start + self.e_lfanew as usize);
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let e_magic = r.u16()?;
        let e_cblp = r.u16()?;
        let e_cp = r.u16()?;
        r.skip(2)?;
        let e_cparhdr = r.u16()?;
        r.skip(2)?;
        let e_maxalloc = r.u16()?;
        r.skip(2)?;
        let e_sp = r.u16()?;
        r.skip(6)?;
        let e_lfarlc = r.u16()?;
        r.skip(2 + 32)?;
        let e_lfanew = r.u32()?;
        Ok(Self {
            e_magic,
            e_cblp,
            e_cp,
            e_cparhdr,
            e_maxalloc,
            e_sp,
            e_lfarlc,
            e_lfanew,
        })
    }
}

impl Default for DosHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// COFF File Header (20 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

impl CoffHeader {
    pub fn new(num_sections: u16, size_of_optional_header: u16) -> Self {
        Self {
            machine: consts::IMAGE_FILE_MACHINE_AMD64,
            number_of_sections: num_sections,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header,
            characteristics: consts::IMAGE_FILE_EXECUTABLE_IMAGE
                | consts::IMAGE_FILE_RELOCS_STRIPPED
                | consts::IMAGE_FILE_LARGE_ADDRESS_AWARE,
        }
    }

    pub fn write(&self, w: &mut ByteWriter) {
        w.u16(self.machine);
        w.u16(self.number_of_sections);
        w.u32(self.time_date_stamp);
        w.u32(self.pointer_to_symbol_table);
        w.u32(self.number_of_symbols);
        w.u16(self.size_of_optional_header);
        w.u16(self.characteristics);
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            machine: r.u16()?,
            number_of_sections: r.u16()?,
            time_date_stamp: r.u32()?,
            pointer_to_symbol_table: r.u32()?,
            number_of_symbols: r.u32()?,
            size_of_optional_header: r.u16()?,
            characteristics: r.u16()?,
        })
    }
}

/// Data Directory entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn write(&self, w: &mut ByteWriter) {
        w.u32(self.virtual_address);
        w.u32(self.size);
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            virtual_address: r.u32()?,
            size: r.u32()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.virtual_address == 0 && self.size == 0
    }
}

/// Optional Header (PE32+)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionalHeader {
    // Standard fields
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,

    // PE32+ fields
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_os_version: u16,
    pub minor_os_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,

    // Data directories
    pub data_directories: [DataDirectory; consts::DATA_DIRECTORY_COUNT],
}

impl Default for OptionalHeader {
    fn default() -> Self {
        Self {
            magic: consts::PE32_PLUS_MAGIC,
            major_linker_version: 14,
            minor_linker_version: 0,
            size_of_code: 0,
            size_of_initialized_data: 0,
            size_of_uninitialized_data: 0,
            address_of_entry_point: 0,
            base_of_code: 0,
            image_base: consts::DEFAULT_IMAGE_BASE,
            section_alignment: consts::SECTION_ALIGNMENT,
            file_alignment: consts::FILE_ALIGNMENT,
            major_os_version: 6,
            minor_os_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 6,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            size_of_image: 0,
            size_of_headers: 0,
            checksum: 0,
            subsystem: consts::IMAGE_SUBSYSTEM_WINDOWS_CUI,
            dll_characteristics: consts::IMAGE_DLLCHARACTERISTICS_NX_COMPAT
                | consts::IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE,
            size_of_stack_reserve: 0x100000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x100000,
            size_of_heap_commit: 0x1000,
            loader_flags: 0,
            number_of_rva_and_sizes: consts::DATA_DIRECTORY_COUNT as u32,
            data_directories: [DataDirectory::default(); consts::DATA_DIRECTORY_COUNT],
        }
    }
}

impl OptionalHeader {
    pub fn write(&self, w: &mut ByteWriter) {
        w.u16(self.magic);
        w.u8(self.major_linker_version);
        w.u8(self.minor_linker_version);
        w.u32(self.size_of_code);
        w.u32(self.size_of_initialized_data);
        w.u32(self.size_of_uninitialized_data);
        w.u32(self.address_of_entry_point);
        w.u32(self.base_of_code);
        w.u64(self.image_base);
        w.u32(self.section_alignment);
        w.u32(self.file_alignment);
        w.u16(self.major_os_version);
        w.u16(self.minor_os_version);
        w.u16(self.major_image_version);
        w.u16(self.minor_image_version);
        w.u16(self.major_subsystem_version);
        w.u16(self.minor_subsystem_version);
        w.u32(self.win32_version_value);
        w.u32(self.size_of_image);
        w.u32(self.size_of_headers);
        w.u32(self.checksum);
        w.u16(self.subsystem);
        w.u16(self.dll_characteristics);
        w.u64(self.size_of_stack_reserve);
        w.u64(self.size_of_stack_commit);
        w.u64(self.size_of_heap_reserve);
        w.u64(self.size_of_heap_commit);
        w.u32(self.loader_flags);
        w.u32(self.number_of_rva_and_sizes);

        for dd in self
            .data_directories
            .iter()
            .take(self.number_of_rva_and_sizes as usize)
        {
            dd.write(w);
        }
    }

    /// Serialized form; its length is what `SizeOfOptionalHeader` must hold
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(240);
        self.write(&mut w);
        w.into_bytes()
    }

    /// Read a PE32+ optional header. Directories beyond the sixteen the
    /// format defines are skipped.
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let mut header = Self {
            magic: r.u16()?,
            major_linker_version: r.u8()?,
            minor_linker_version: r.u8()?,
            size_of_code: r.u32()?,
            size_of_initialized_data: r.u32()?,
            size_of_uninitialized_data: r.u32()?,
            address_of_entry_point: r.u32()?,
            base_of_code: r.u32()?,
            image_base: r.u64()?,
            section_alignment: r.u32()?,
            file_alignment: r.u32()?,
            major_os_version: r.u16()?,
            minor_os_version: r.u16()?,
            major_image_version: r.u16()?,
            minor_image_version: r.u16()?,
            major_subsystem_version: r.u16()?,
            minor_subsystem_version: r.u16()?,
            win32_version_value: r.u32()?,
            size_of_image: r.u32()?,
            size_of_headers: r.u32()?,
            checksum: r.u32()?,
            subsystem: r.u16()?,
            dll_characteristics: r.u16()?,
            size_of_stack_reserve: r.u64()?,
            size_of_stack_commit: r.u64()?,
            size_of_heap_reserve: r.u64()?,
            size_of_heap_commit: r.u64()?,
            loader_flags: r.u32()?,
            number_of_rva_and_sizes: r.u32()?,
            data_directories: [DataDirectory::default(); consts::DATA_DIRECTORY_COUNT],
        };

        for i in 0..header.number_of_rva_and_sizes as usize {
            let dd = DataDirectory::read(r)?;
            if let Some(slot) = header.data_directories.get_mut(i) {
                *slot = dd;
            }
        }

        Ok(header)
    }
}

/// Section Header (40 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
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
    /// Names longer than eight bytes are truncated
    pub fn new(name: &str, characteristics: u32) -> Self {
        let mut name_bytes = [0u8; 8];
        let bytes = name.as_bytes();
        let len = bytes.len().min(8);
        name_bytes[..len].copy_from_slice(&bytes[..len]);

        Self {
            name: name_bytes,
            virtual_size: 0,
            virtual_address: 0,
            size_of_raw_data: 0,
            pointer_to_raw_data: 0,
            pointer_to_relocations: 0,
            pointer_to_linenumbers: 0,
            number_of_relocations: 0,
            number_of_linenumbers: 0,
            characteristics,
        }
    }

    /// Section name with the NUL padding removed
    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Whether `rva` falls inside this section's mapped contents
    pub fn contains_rva(&self, rva: u32) -> bool {
        let extent = self.virtual_size.max(self.size_of_raw_data) as u64;
        let start = self.virtual_address as u64;
        (rva as u64) >= start && (rva as u64) < start + extent
    }

    pub fn write(&self, w: &mut ByteWriter) {
        w.fixed::<{ consts::SECTION_NAME_SIZE }>(&self.name);
        w.u32(self.virtual_size);
        w.u32(self.virtual_address);
        w.u32(self.size_of_raw_data);
        w.u32(self.pointer_to_raw_data);
        w.u32(self.pointer_to_relocations);
        w.u32(self.pointer_to_linenumbers);
        w.u16(self.number_of_relocations);
        w.u16(self.number_of_linenumbers);
        w.u32(self.characteristics);
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            name: r.array::<{ consts::SECTION_NAME_SIZE }>()?,
            virtual_size: r.u32()?,
            virtual_address: r.u32()?,
            size_of_raw_data: r.u32()?,
            pointer_to_raw_data: r.u32()?,
            pointer_to_relocations: r.u32()?,
            pointer_to_linenumbers: r.u32()?,
            number_of_relocations: r.u16()?,
            number_of_linenumbers: r.u16()?,
            characteristics: r.u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dos_header_size() {
        let header = DosHeader::new();
        let mut w = ByteWriter::new();
        header.write(&mut w);
        assert_eq!(w.position(), consts::DOS_HEADER_SIZE);
    }

    #[test]
    fn test_dos_stub_ends_at_lfanew() {
        let header = DosHeader::new();
        let mut w = ByteWriter::new();
        header.write_with_stub(&mut w);
        assert_eq!(w.position(), header.e_lfanew as usize);
        assert_eq!(header.e_lfanew, 0x80);
        assert_eq!(&w.as_slice()[0x4E..0x4E + 4], b"This");
    }

    #[test]
    fn test_dos_header_round_trip() {
        let header = DosHeader::with_lfanew(0xF0);
        let mut w = ByteWriter::new();
        header.write(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[0..2], b"MZ");
        assert_eq!(&bytes[0x3C..0x40], &0xF0u32.to_le_bytes());
        let parsed = DosHeader::read(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_coff_header_size() {
        let header = CoffHeader::new(2, 240);
        let mut w = ByteWriter::new();
        header.write(&mut w);
        assert_eq!(w.position(), consts::COFF_HEADER_SIZE);
        assert_eq!(header.characteristics, 0x0023);
    }

    #[test]
    fn test_optional_header_size() {
        let header = OptionalHeader::default();
        assert_eq!(header.to_bytes().len(), 240);
    }

    #[test]
    fn test_optional_header_round_trip() {
        let mut header = OptionalHeader::default();
        header.address_of_entry_point = 0x1000;
        header.size_of_image = 0x3000;
        header.data_directories[consts::IMAGE_DIRECTORY_ENTRY_IMPORT] = DataDirectory {
            virtual_address: 0x2000,
            size: 40,
        };
        let bytes = header.to_bytes();
        let parsed = OptionalHeader::read(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_section_header_size() {
        let header = SectionHeader::new(".text", 0);
        let mut w = ByteWriter::new();
        header.write(&mut w);
        assert_eq!(w.position(), consts::SECTION_HEADER_SIZE);
        assert_eq!(&w.as_slice()[..8], b".text\0\0\0");
    }

    #[test]
    fn test_section_contains_rva() {
        let mut header = SectionHeader::new(".idata", consts::IDATA_CHARACTERISTICS);
        header.virtual_address = 0x2000;
        header.virtual_size = 99;
        header.size_of_raw_data = 0x200;
        assert!(header.contains_rva(0x2000));
        assert!(header.contains_rva(0x21FF));
        assert!(!header.contains_rva(0x2200));
        assert!(!header.contains_rva(0x1FFF));
        assert_eq!(header.name_str(), ".idata");
    }
}
