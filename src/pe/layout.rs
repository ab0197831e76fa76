//! Image Layout
//!
//! Places sections in virtual memory and in the file. Every RVA, file
//! pointer and size in the headers comes from here.
//!
//! ## Placement rules
//!
//! ```text
//! file:    [headers ↑FileAlignment][.text ↑FileAlignment][.idata ↑FileAlignment]
//! memory:  [headers ↑SectionAlignment][.text ↑SectionAlignment][.idata ...]
//! ```
//!
//! Sections are laid out in order. Virtual addresses are strictly increasing
//! multiples of the section alignment, file pointers strictly increasing
//! multiples of the file alignment. A section may pin its virtual address
//! as long as that does not move it backwards.

use log::{debug, trace};
use serde::Serialize;

use crate::error::{PeError, Result};

use super::consts;

/// Round `value` up to a multiple of `alignment` (a power of two).
/// Returns `None` on overflow.
pub fn align_up(value: u32, alignment: u32) -> Option<u32> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

pub fn is_aligned(value: u32, alignment: u32) -> bool {
    value & (alignment - 1) == 0
}

/// Nearest power of two at or above `value`, capped at the largest one a u32 holds
fn suggested_alignment(value: u32) -> u64 {
    value.checked_next_power_of_two().map_or(1 << 31, u64::from)
}

/// Both alignments must be powers of two, with file alignment not exceeding
/// section alignment
pub fn check_alignments(section_alignment: u32, file_alignment: u32) -> Result<()> {
    if !section_alignment.is_power_of_two() {
        return Err(PeError::AlignmentViolation {
            what: "section alignment",
            value: section_alignment as u64,
            alignment: suggested_alignment(section_alignment),
        });
    }
    if !file_alignment.is_power_of_two() {
        return Err(PeError::AlignmentViolation {
            what: "file alignment",
            value: file_alignment as u64,
            alignment: suggested_alignment(file_alignment),
        });
    }
    if file_alignment > section_alignment {
        return Err(PeError::AlignmentViolation {
            what: "section alignment",
            value: section_alignment as u64,
            alignment: file_alignment as u64,
        });
    }
    Ok(())
}

/// Total length of the header region before alignment padding
pub fn headers_len(e_lfanew: u32, optional_header_size: u16, num_sections: usize) -> usize {
    e_lfanew as usize
        + consts::PE_SIGNATURE_SIZE
        + consts::COFF_HEADER_SIZE
        + optional_header_size as usize
        + consts::SECTION_HEADER_SIZE * num_sections
}

/// A section waiting to be placed
#[derive(Debug, Clone)]
pub struct SectionRequest<'a> {
    pub name: &'a str,
    pub len: usize,
    pub pinned_rva: Option<u32>,
    pub characteristics: u32,
}

/// Where a section ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionPlacement {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub pointer_to_raw_data: u32,
    pub size_of_raw_data: u32,
    pub characteristics: u32,
}

impl SectionPlacement {
    /// Address space reserved for the section. Empty sections still take a page.
    fn virtual_span(&self, section_alignment: u32) -> Option<u32> {
        align_up(self.virtual_size, section_alignment).map(|s| s.max(section_alignment))
    }

    fn is_present(&self) -> bool {
        self.size_of_raw_data > 0
    }
}

/// The fully computed layout of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageLayout {
    pub e_lfanew: u32,
    pub optional_header_size: u16,
    pub headers_len: u32,
    pub size_of_headers: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_image: u32,
    pub sections: Vec<SectionPlacement>,
}

impl ImageLayout {
    /// Place `sections` after a header region of the given shape
    pub fn plan(
        section_alignment: u32,
        file_alignment: u32,
        e_lfanew: u32,
        optional_header_size: u16,
        sections: &[SectionRequest<'_>],
    ) -> Result<Self> {
        check_alignments(section_alignment, file_alignment)?;

        let raw_headers_len = headers_len(e_lfanew, optional_header_size, sections.len());
        let headers_len = u32::try_from(raw_headers_len).map_err(|_| PeError::OversizedSection {
            name: "headers".to_string(),
            size: raw_headers_len as u64,
        })?;
        let oversized = |name: &str, size: u64| PeError::OversizedSection {
            name: name.to_string(),
            size,
        };

        let size_of_headers =
            align_up(headers_len, file_alignment).ok_or_else(|| oversized("headers", headers_len as u64))?;
        let mut next_rva =
            align_up(headers_len, section_alignment).ok_or_else(|| oversized("headers", headers_len as u64))?;
        let mut next_ptr = size_of_headers;
        let mut previous = "headers";

        debug!(
            "headers: {:#x} bytes, SizeOfHeaders {:#x}, first RVA {:#x}",
            headers_len, size_of_headers, next_rva
        );

        let mut placed = Vec::with_capacity(sections.len());
        for req in sections {
            let virtual_size =
                u32::try_from(req.len).map_err(|_| oversized(req.name, req.len as u64))?;

            let virtual_address = match req.pinned_rva {
                Some(rva) => {
                    if !is_aligned(rva, section_alignment) {
                        return Err(PeError::AlignmentViolation {
                            what: "section virtual address",
                            value: rva as u64,
                            alignment: section_alignment as u64,
                        });
                    }
                    if rva < next_rva {
                        return Err(PeError::SectionOverlap {
                            first: previous.to_string(),
                            second: req.name.to_string(),
                        });
                    }
                    rva
                }
                None => next_rva,
            };

            let size_of_raw_data = align_up(virtual_size, file_alignment)
                .ok_or_else(|| oversized(req.name, req.len as u64))?;
            let pointer_to_raw_data = if size_of_raw_data == 0 { 0 } else { next_ptr };

            let placement = SectionPlacement {
                name: req.name.to_string(),
                virtual_address,
                virtual_size,
                pointer_to_raw_data,
                size_of_raw_data,
                characteristics: req.characteristics,
            };

            let span = placement
                .virtual_span(section_alignment)
                .ok_or_else(|| oversized(req.name, req.len as u64))?;
            next_rva = virtual_address
                .checked_add(span)
                .ok_or_else(|| oversized(req.name, req.len as u64))?;
            next_ptr = next_ptr
                .checked_add(size_of_raw_data)
                .ok_or_else(|| oversized(req.name, req.len as u64))?;

            trace!(
                "{}: rva {:#x} vsize {:#x}, file {:#x} raw {:#x}",
                placement.name,
                placement.virtual_address,
                placement.virtual_size,
                placement.pointer_to_raw_data,
                placement.size_of_raw_data
            );

            previous = req.name;
            placed.push(placement);
        }

        let layout = Self {
            e_lfanew,
            optional_header_size,
            headers_len,
            size_of_headers,
            section_alignment,
            file_alignment,
            size_of_image: next_rva,
            sections: placed,
        };
        layout.validate()?;

        debug!(
            "layout: {} sections, SizeOfImage {:#x}, file size {:#x}",
            layout.sections.len(),
            layout.size_of_image,
            layout.file_size()
        );
        Ok(layout)
    }

    /// Check every alignment and overlap invariant of the layout.
    ///
    /// `plan` only produces layouts that pass, but a layout may also be
    /// assembled or edited by hand before it is serialized.
    pub fn validate(&self) -> Result<()> {
        let sa = self.section_alignment;
        let fa = self.file_alignment;
        check_alignments(sa, fa)?;

        if !is_aligned(self.size_of_headers, fa) || self.size_of_headers < self.headers_len {
            return Err(PeError::AlignmentViolation {
                what: "SizeOfHeaders",
                value: self.size_of_headers as u64,
                alignment: fa as u64,
            });
        }

        let mut previous = "headers";
        let mut previous_end = align_up(self.headers_len, sa).ok_or(PeError::OversizedSection {
            name: "headers".to_string(),
            size: self.headers_len as u64,
        })?;

        for s in &self.sections {
            if !is_aligned(s.virtual_address, sa) {
                return Err(PeError::AlignmentViolation {
                    what: "section virtual address",
                    value: s.virtual_address as u64,
                    alignment: sa as u64,
                });
            }
            if s.virtual_address < previous_end {
                return Err(PeError::SectionOverlap {
                    first: previous.to_string(),
                    second: s.name.clone(),
                });
            }
            if s.is_present() {
                if !is_aligned(s.pointer_to_raw_data, fa) {
                    return Err(PeError::AlignmentViolation {
                        what: "section raw data pointer",
                        value: s.pointer_to_raw_data as u64,
                        alignment: fa as u64,
                    });
                }
                if !is_aligned(s.size_of_raw_data, fa) {
                    return Err(PeError::AlignmentViolation {
                        what: "section raw data size",
                        value: s.size_of_raw_data as u64,
                        alignment: fa as u64,
                    });
                }
                if s.pointer_to_raw_data < self.size_of_headers {
                    return Err(PeError::SectionOverlap {
                        first: "headers".to_string(),
                        second: s.name.clone(),
                    });
                }
            }

            previous = s.name.as_str();
            previous_end = s
                .virtual_address
                .checked_add(s.virtual_span(sa).unwrap_or(u32::MAX))
                .ok_or(PeError::OversizedSection {
                    name: s.name.clone(),
                    size: s.virtual_size as u64,
                })?;
        }

        for (i, a) in self.sections.iter().enumerate() {
            for b in self.sections.iter().skip(i + 1) {
                if !a.is_present() || !b.is_present() {
                    continue;
                }
                let a_end = a.pointer_to_raw_data as u64 + a.size_of_raw_data as u64;
                let b_end = b.pointer_to_raw_data as u64 + b.size_of_raw_data as u64;
                if (a.pointer_to_raw_data as u64) < b_end && (b.pointer_to_raw_data as u64) < a_end {
                    return Err(PeError::SectionOverlap {
                        first: a.name.clone(),
                        second: b.name.clone(),
                    });
                }
            }
        }

        if self.size_of_image < previous_end || !is_aligned(self.size_of_image, sa) {
            return Err(PeError::AlignmentViolation {
                what: "SizeOfImage",
                value: self.size_of_image as u64,
                alignment: sa as u64,
            });
        }

        Ok(())
    }

    /// Length of the serialized file
    pub fn file_size(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| s.is_present())
            .map(|s| s.pointer_to_raw_data as usize + s.size_of_raw_data as usize)
            .max()
            .unwrap_or(0)
            .max(self.size_of_headers as usize)
    }

    pub fn section(&self, name: &str) -> Option<&SectionPlacement> {
        self.sections.iter().find(|s| s.name == name)
    }
}
