//! # minpe
//!
//! Writes minimal Windows x64 (PE32+) executables: one code section and one
//! import section, with every size, offset and RVA in the headers derived
//! from the actual encoded structures.
//!
//! ## Pipeline
//!
//! | Step | Function | Output |
//! |------|----------|--------|
//! | 1 | [`build_import_table`] | `.idata` blob valid at a chosen RVA |
//! | 2 | [`build_image`] | complete PE32+ file |
//!
//! Machine code comes in pre-encoded and is only measured, never inspected.
//! Writing the result anywhere is up to the caller.
//!
//! ```no_run
//! let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]; // mov eax, 42; ret
//! let idata = minpe::build_import_table(0x2000, "kernel32.dll", "ExitProcess")?;
//! let exe = minpe::build_image(&code, 0x2000, &idata)?;
//! std::fs::write("program.exe", exe).unwrap();
//! # Ok::<(), minpe::PeError>(())
//! ```

pub mod binary;
pub mod error;
pub mod pe;

pub use error::{PeError, Result};
pub use pe::{
    build_console_executable, build_image, build_import_table, ImageBuilder, ImageConfig,
    ImageLayout, ImageView, ImportTable, ImportTableBuilder, Section,
};
