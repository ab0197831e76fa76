//! Import Table Construction
//!
//! Builds the `.idata` contents for a set of (DLL, function) imports as a
//! self-contained blob. Every pointer inside the blob is an RVA computed as
//! `base_rva + local offset`, so the blob is only correct when mapped at the
//! `base_rva` it was built for.
//!
//! ## Layout
//!
//! ```text
//! +0                 Import Directory Table   (dlls + 1) × 20, null entry last
//! ↑8                 Import Lookup Table      per dll: (functions + 1) × 8
//!                    Import Address Table     same shape as the lookup table
//!                    DLL names                NUL-terminated
//! ↑2                 Hint/Name entries        u16 hint, NUL-terminated name, even length
//! ↑512               padding
//! ```
//!
//! The lookup and address tables are separate arrays with identical initial
//! contents. The loader overwrites the address table with resolved function
//! addresses and leaves the lookup table alone.

use log::{debug, trace};

use crate::binary::{ByteReader, ByteWriter};
use crate::error::{PeError, Result};

use super::consts;
use super::headers::DataDirectory;

/// A function imported by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedFunction {
    pub name: String,
    pub hint: u16,
}

/// All functions imported from one DLL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub dll: String,
    pub functions: Vec<ImportedFunction>,
}

/// Check a DLL or function name before it is encoded
pub fn validate_identifier(name: &str) -> Result<()> {
    let invalid = |reason| PeError::InvalidIdentifier {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.bytes().any(|b| b == 0) {
        return Err(invalid("name contains a NUL byte"));
    }
    if !name.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(invalid("name must be printable ASCII"));
    }
    if name.len() > consts::MAX_IDENTIFIER_LEN {
        return Err(PeError::NameTooLong {
            name: name.to_string(),
            len: name.len(),
            max: consts::MAX_IDENTIFIER_LEN,
        });
    }
    Ok(())
}

fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Local offsets of every sub-structure, derived from the encoded sizes
#[derive(Debug)]
struct ImportLayout {
    directory_len: usize,
    ilt_offset: usize,
    iat_offset: usize,
    /// Start of each DLL's thunk array, relative to the ILT/IAT start
    thunk_offsets: Vec<usize>,
    thunks_len: usize,
    dll_name_offsets: Vec<usize>,
    hint_name_offsets: Vec<Vec<usize>>,
    content_len: usize,
    blob_len: usize,
}

impl ImportLayout {
    fn compute(descriptors: &[ImportDescriptor]) -> Self {
        let directory_len = (descriptors.len() + 1) * consts::IMPORT_DESCRIPTOR_SIZE;
        let ilt_offset = align(directory_len, consts::THUNK_SIZE);

        let mut thunk_offsets = Vec::with_capacity(descriptors.len());
        let mut thunks_len = 0;
        for d in descriptors {
            thunk_offsets.push(thunks_len);
            thunks_len += (d.functions.len() + 1) * consts::THUNK_SIZE;
        }
        let iat_offset = ilt_offset + thunks_len;

        let mut cursor = iat_offset + thunks_len;
        let mut dll_name_offsets = Vec::with_capacity(descriptors.len());
        for d in descriptors {
            dll_name_offsets.push(cursor);
            cursor += d.dll.len() + 1;
        }

        cursor = align(cursor, consts::HINT_SIZE);
        let mut hint_name_offsets = Vec::with_capacity(descriptors.len());
        for d in descriptors {
            let mut offsets = Vec::with_capacity(d.functions.len());
            for f in &d.functions {
                offsets.push(cursor);
                cursor += align(consts::HINT_SIZE + f.name.len() + 1, 2);
            }
            hint_name_offsets.push(offsets);
        }

        let content_len = cursor;
        let blob_len = align(content_len.max(1), consts::IMPORT_BLOCK_SIZE);

        Self {
            directory_len,
            ilt_offset,
            iat_offset,
            thunk_offsets,
            thunks_len,
            dll_name_offsets,
            hint_name_offsets,
            content_len,
            blob_len,
        }
    }
}

/// Resolved location of one imported function's address slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IatSlot {
    pub dll: String,
    pub function: String,
    pub rva: u32,
}

/// A serialized import table and the directory entries describing it
#[derive(Debug, Clone)]
pub struct ImportTable {
    bytes: Vec<u8>,
    base_rva: u32,
    content_len: usize,
    directory: DataDirectory,
    iat: DataDirectory,
    slots: Vec<IatSlot>,
}

impl ImportTable {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn base_rva(&self) -> u32 {
        self.base_rva
    }

    /// Length of the meaningful contents, before block padding
    pub fn content_len(&self) -> usize {
        self.content_len
    }

    /// Value for the Import data directory
    pub fn directory(&self) -> DataDirectory {
        self.directory
    }

    /// Value for the IAT data directory
    pub fn iat(&self) -> DataDirectory {
        self.iat
    }

    pub fn slots(&self) -> &[IatSlot] {
        &self.slots
    }

    /// RVA of the address table entry the loader fills in for `function`
    pub fn iat_slot(&self, dll: &str, function: &str) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.dll.eq_ignore_ascii_case(dll) && s.function == function)
            .map(|s| s.rva)
    }
}

/// Import table builder
#[derive(Debug, Clone)]
pub struct ImportTableBuilder {
    base_rva: u32,
    descriptors: Vec<ImportDescriptor>,
}

impl ImportTableBuilder {
    /// Builder for a table that will be mapped at `base_rva`
    pub fn new(base_rva: u32) -> Self {
        Self {
            base_rva,
            descriptors: Vec::new(),
        }
    }

    /// Import `function` from `dll` with hint 0
    pub fn import(self, dll: &str, function: &str) -> Self {
        self.import_with_hint(dll, function, 0)
    }

    /// Import `function` from `dll`. Functions from the same DLL share one
    /// directory entry.
    pub fn import_with_hint(mut self, dll: &str, function: &str, hint: u16) -> Self {
        let func = ImportedFunction {
            name: function.to_string(),
            hint,
        };
        match self
            .descriptors
            .iter_mut()
            .find(|d| d.dll.eq_ignore_ascii_case(dll))
        {
            Some(d) => d.functions.push(func),
            None => self.descriptors.push(ImportDescriptor {
                dll: dll.to_string(),
                functions: vec![func],
            }),
        }
        self
    }

    pub fn descriptors(&self) -> &[ImportDescriptor] {
        &self.descriptors
    }

    pub fn build(&self) -> Result<ImportTable> {
        for d in &self.descriptors {
            validate_identifier(&d.dll)?;
            for f in &d.functions {
                validate_identifier(&f.name)?;
            }
        }

        if self.base_rva as usize % consts::THUNK_SIZE != 0 {
            return Err(PeError::AlignmentViolation {
                what: "import table RVA",
                value: self.base_rva as u64,
                alignment: consts::THUNK_SIZE as u64,
            });
        }

        let layout = ImportLayout::compute(&self.descriptors);
        let blob_len = u32::try_from(layout.blob_len)
            .ok()
            .filter(|&len| self.base_rva.checked_add(len).is_some())
            .ok_or(PeError::OversizedSection {
                name: ".idata".to_string(),
                size: layout.blob_len as u64,
            })?;

        debug!(
            "import table at {:#x}: {} dlls, ILT +{:#x}, IAT +{:#x}, {:#x} of {:#x} bytes used",
            self.base_rva,
            self.descriptors.len(),
            layout.ilt_offset,
            layout.iat_offset,
            layout.content_len,
            blob_len
        );

        // Offsets are bounded by blob_len, which fits in u32 alongside base_rva
        let rva = |offset: usize| self.base_rva + offset as u32;

        let mut w = ByteWriter::with_capacity(layout.blob_len);

        // Import Directory Table
        for (i, d) in self.descriptors.iter().enumerate() {
            let ilt_rva = rva(layout.ilt_offset + layout.thunk_offsets[i]);
            let iat_rva = rva(layout.iat_offset + layout.thunk_offsets[i]);
            let name_rva = rva(layout.dll_name_offsets[i]);
            trace!(
                "{}: OriginalFirstThunk {:#x}, Name {:#x}, FirstThunk {:#x}",
                d.dll,
                ilt_rva,
                name_rva,
                iat_rva
            );
            w.u32(ilt_rva);
            w.u32(0); // TimeDateStamp
            w.u32(0); // ForwarderChain
            w.u32(name_rva);
            w.u32(iat_rva);
        }
        w.zeros(consts::IMPORT_DESCRIPTOR_SIZE);

        // Import Lookup Table, then Import Address Table with the same entries
        let mut slots = Vec::new();
        for table_offset in [layout.ilt_offset, layout.iat_offset] {
            w.pad_to(table_offset);
            for (i, d) in self.descriptors.iter().enumerate() {
                for (j, f) in d.functions.iter().enumerate() {
                    if table_offset == layout.iat_offset {
                        slots.push(IatSlot {
                            dll: d.dll.clone(),
                            function: f.name.clone(),
                            rva: rva(w.position()),
                        });
                    }
                    w.u64(rva(layout.hint_name_offsets[i][j]) as u64);
                }
                w.u64(0);
            }
        }

        // DLL names
        for (i, d) in self.descriptors.iter().enumerate() {
            w.pad_to(layout.dll_name_offsets[i]);
            w.cstr(d.dll.as_bytes());
        }

        // Hint/Name entries
        for (i, d) in self.descriptors.iter().enumerate() {
            for (j, f) in d.functions.iter().enumerate() {
                w.pad_to(layout.hint_name_offsets[i][j]);
                w.u16(f.hint);
                w.cstr(f.name.as_bytes());
                w.align(2);
            }
        }

        debug_assert_eq!(w.position(), layout.content_len);
        w.pad_to(layout.blob_len);

        let iat = if self.descriptors.is_empty() {
            DataDirectory::default()
        } else {
            DataDirectory {
                virtual_address: rva(layout.iat_offset),
                size: layout.thunks_len as u32,
            }
        };

        Ok(ImportTable {
            bytes: w.into_bytes(),
            base_rva: self.base_rva,
            content_len: layout.content_len,
            directory: DataDirectory {
                virtual_address: self.base_rva,
                size: layout.directory_len as u32,
            },
            iat,
            slots,
        })
    }
}

/// Build the import table for a single `function` imported from `dll`,
/// to be mapped at `base_rva`
pub fn build_import_table(base_rva: u32, dll_name: &str, function_name: &str) -> Result<Vec<u8>> {
    ImportTableBuilder::new(base_rva)
        .import(dll_name, function_name)
        .build()
        .map(ImportTable::into_bytes)
}

/// Recover the Import and IAT data directories from a serialized import
/// table mapped at `base_rva`.
///
/// Every RVA in the directory table, the lookup tables and the address
/// tables must resolve inside the blob.
pub fn locate_directories(blob: &[u8], base_rva: u32) -> Result<(DataDirectory, DataDirectory)> {
    let malformed = |msg: String| PeError::MalformedImportTable(msg);
    let local = |rva: u32, what: &str| -> Result<usize> {
        rva.checked_sub(base_rva)
            .map(|off| off as usize)
            .filter(|&off| off < blob.len())
            .ok_or_else(|| {
                malformed(format!(
                    "{} RVA {:#x} lies outside [{:#x}, {:#x})",
                    what,
                    rva,
                    base_rva,
                    base_rva as u64 + blob.len() as u64
                ))
            })
    };

    // Walk a null-terminated thunk array, returning its local [start, end)
    let thunk_table = |rva: u32, what: &str| -> Result<(usize, usize)> {
        let start = local(rva, what)?;
        let mut thunks = ByteReader::at(blob, start);
        loop {
            let entry = thunks
                .u64()
                .map_err(|_| malformed(format!("{} at {:#x} is not terminated", what, rva)))?;
            if entry == 0 {
                break;
            }
            if entry & consts::IMPORT_BY_ORDINAL_FLAG != 0 {
                if entry & !(consts::IMPORT_BY_ORDINAL_FLAG | 0xFFFF) != 0 {
                    return Err(malformed(format!(
                        "{} entry {:#x} has reserved ordinal bits set",
                        what, entry
                    )));
                }
                continue;
            }
            let hint_name = u32::try_from(entry).map_err(|_| {
                malformed(format!(
                    "{} entry {:#x} has reserved high bits set",
                    what, entry
                ))
            })?;
            local(hint_name, "hint/name")?;
        }
        Ok((start, thunks.position()))
    };

    let truncated = |_: PeError| malformed("import directory table is not terminated".to_string());

    let mut r = ByteReader::new(blob);
    let mut count = 0usize;
    let mut iat_range: Option<(usize, usize)> = None;

    loop {
        let original_first_thunk = r.u32().map_err(truncated)?;
        let _time_date_stamp = r.u32().map_err(truncated)?;
        let _forwarder_chain = r.u32().map_err(truncated)?;
        let name = r.u32().map_err(truncated)?;
        let first_thunk = r.u32().map_err(truncated)?;

        if original_first_thunk == 0 && name == 0 && first_thunk == 0 {
            break;
        }
        count += 1;

        local(name, "DLL name")?;
        if original_first_thunk != 0 {
            thunk_table(original_first_thunk, "lookup table")?;
        }
        let (start, end) = thunk_table(first_thunk, "address table")?;

        iat_range = Some(match iat_range {
            Some((lo, hi)) => (lo.min(start), hi.max(end)),
            None => (start, end),
        });
    }

    let directory = DataDirectory {
        virtual_address: base_rva,
        size: ((count + 1) * consts::IMPORT_DESCRIPTOR_SIZE) as u32,
    };
    let iat = match iat_range {
        Some((lo, hi)) => DataDirectory {
            virtual_address: base_rva + lo as u32,
            size: (hi - lo) as u32,
        },
        None => DataDirectory::default(),
    };

    Ok((directory, iat))
}
