//! PE entry resolution

use goblin::pe::section_table::{SectionTable, IMAGE_SCN_MEM_EXECUTE};
use goblin::pe::PE;

use super::loader::{ResolvedEntry, SourceFormat};
use crate::error::{LoaderError, Result};

/// Name of the section whose raw bytes are loaded as the shellcode
pub const CODE_SECTION: &str = ".text";

fn section_name(section: &SectionTable) -> String {
    String::from_utf8_lossy(&section.name)
        .trim_end_matches('\0')
        .to_string()
}

/// Locate the entry point of a PE container.
///
/// Only the code section's raw bytes are placed in memory, so the offset is the entry
/// RVA relative to that section's RVA rather than to the image base. Without a `.text`
/// section the first executable section is used with offset 0, unless `strict` is set.
pub fn resolve_pe(pe: &PE<'_>, buffer: &[u8], strict: bool) -> Result<ResolvedEntry> {
    let entry_rva = pe.entry as u64;
    let format = SourceFormat::Pe {
        machine: pe.header.coff_header.machine,
    };

    if let Some(text) = pe.sections.iter().find(|s| section_name(s) == CODE_SECTION) {
        let text_rva = text.virtual_address as u64;
        let offset = entry_rva.checked_sub(text_rva).ok_or_else(|| {
            LoaderError::NoEntry(format!(
                "entry RVA 0x{:x} precedes {} at RVA 0x{:x}",
                entry_rva, CODE_SECTION, text_rva
            ))
        })?;

        return Ok(ResolvedEntry {
            offset: offset as usize,
            code: raw_range(text, buffer.len())?,
            format,
        });
    }

    if strict {
        return Err(LoaderError::NoEntry(format!(
            "no {} section in PE container",
            CODE_SECTION
        )));
    }

    let fallback = pe
        .sections
        .iter()
        .find(|s| (s.characteristics & IMAGE_SCN_MEM_EXECUTE) != 0 && s.size_of_raw_data > 0)
        .ok_or_else(|| LoaderError::NoEntry("no executable section in PE container".to_string()))?;

    log::warn!(
        "No {} section, assuming entry at the start of '{}'",
        CODE_SECTION,
        section_name(fallback)
    );

    Ok(ResolvedEntry {
        offset: 0,
        code: raw_range(fallback, buffer.len())?,
        format,
    })
}

fn raw_range(section: &SectionTable, len: usize) -> Result<std::ops::Range<usize>> {
    let start = section.pointer_to_raw_data as usize;
    match start.checked_add(section.size_of_raw_data as usize) {
        Some(end) if section.size_of_raw_data > 0 && end <= len => Ok(start..end),
        _ => Err(LoaderError::NoEntry(format!(
            "section '{}' has no raw data inside the file",
            section_name(section)
        ))),
    }
}
