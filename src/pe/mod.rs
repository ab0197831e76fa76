//! PE32+ Image Construction for Windows x64
//!
//! Builds minimal Windows x64 executables from pre-encoded machine code
//! and a synthesized import table. No external linker required.
//!
//! ## Architecture
//!
//! ```text
//! (dll, function) → ImportTableBuilder → .idata blob ─┐
//!                                                     ├→ ImageBuilder → PE32+ bytes
//! machine code ───────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `headers`: DOS/COFF/Optional/section header structures
//! - `layout`: alignment arithmetic and section placement
//! - `import`: import directory, lookup and address tables
//! - `image`: the image builder
//! - `view`: read-only parser over a serialized image

pub mod headers;
pub mod image;
pub mod import;
pub mod layout;
pub mod view;

pub use headers::{CoffHeader, DataDirectory, DosHeader, OptionalHeader, SectionHeader};
pub use image::{
    build_console_executable, build_image, import_table_rva_after, ImageBuilder, ImageConfig, Section,
};
pub use import::{build_import_table, ImportTable, ImportTableBuilder};
pub use layout::{ImageLayout, SectionPlacement};
pub use view::ImageView;

/// PE file constants
pub mod consts {
    // DOS Header magic
    pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"

    // PE Signature
    pub const PE_SIGNATURE: [u8; 4] = *b"PE\0\0";

    // Machine types
    pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

    // File characteristics
    pub const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;
    pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
    pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;

    // Optional header magic
    pub const PE32_PLUS_MAGIC: u16 = 0x020B; // PE32+ (64-bit)

    // Subsystem
    pub const IMAGE_SUBSYSTEM_WINDOWS_GUI: u16 = 2;
    pub const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3; // Console application

    // DLL characteristics
    pub const IMAGE_DLLCHARACTERISTICS_NX_COMPAT: u16 = 0x0100;
    pub const IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE: u16 = 0x8000;

    // Section characteristics
    pub const IMAGE_SCN_CNT_CODE: u32 = 0x00000020;
    pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x00000040;
    pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x20000000;
    pub const IMAGE_SCN_MEM_READ: u32 = 0x40000000;
    pub const IMAGE_SCN_MEM_WRITE: u32 = 0x80000000;

    pub const TEXT_CHARACTERISTICS: u32 =
        IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ;
    pub const IDATA_CHARACTERISTICS: u32 =
        IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;

    // Data directory indices
    pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
    pub const IMAGE_DIRECTORY_ENTRY_IAT: usize = 12;

    // Sizes
    pub const DOS_HEADER_SIZE: usize = 64;
    pub const PE_SIGNATURE_SIZE: usize = 4;
    pub const COFF_HEADER_SIZE: usize = 20;
    pub const SECTION_HEADER_SIZE: usize = 40;
    pub const SECTION_NAME_SIZE: usize = 8;
    pub const DATA_DIRECTORY_COUNT: usize = 16;

    // Import structures
    pub const IMPORT_DESCRIPTOR_SIZE: usize = 20;
    pub const THUNK_SIZE: usize = 8; // PE32+ lookup/address entries
    pub const HINT_SIZE: usize = 2;
    pub const IMPORT_BLOCK_SIZE: usize = 512;
    pub const IMPORT_BY_ORDINAL_FLAG: u64 = 1 << 63;
    pub const MAX_IDENTIFIER_LEN: usize = 255;

    // Alignment
    pub const SECTION_ALIGNMENT: u32 = 0x1000; // 4KB
    pub const FILE_ALIGNMENT: u32 = 0x200; // 512 bytes

    // Default image base for 64-bit
    pub const DEFAULT_IMAGE_BASE: u64 = 0x140000000;
}
