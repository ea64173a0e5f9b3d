//! ELF entry resolution

use goblin::elf::program_header::{PF_X, PT_LOAD};
use goblin::elf::section_header::SHF_EXECINSTR;
use goblin::elf::Elf;

use super::loader::{ResolvedEntry, SourceFormat};
use crate::error::{LoaderError, Result};

/// Locate the entry point of an ELF container.
///
/// The offset is `e_entry` minus the load address of the executable segment that
/// contains it, so the segment's file bytes can be placed at any base.
pub fn resolve_elf(elf: &Elf<'_>, buffer: &[u8]) -> Result<ResolvedEntry> {
    let entry = elf.header.e_entry;
    let format = SourceFormat::Elf {
        machine: elf.header.e_machine,
    };

    let segment = elf.program_headers.iter().find(|ph| {
        ph.p_type == PT_LOAD
            && (ph.p_flags & PF_X) != 0
            && ph.p_filesz > 0
            && entry >= ph.p_vaddr
            && entry - ph.p_vaddr < ph.p_filesz
    });

    if let Some(ph) = segment {
        let code = file_range(ph.p_offset, ph.p_filesz, buffer.len())?;
        return Ok(ResolvedEntry {
            offset: (entry - ph.p_vaddr) as usize,
            code,
            format,
        });
    }

    // Objects without program headers still carry section addresses
    let section = elf.section_headers.iter().find(|sh| {
        (sh.sh_flags & SHF_EXECINSTR as u64) != 0
            && sh.sh_size > 0
            && entry >= sh.sh_addr
            && entry - sh.sh_addr < sh.sh_size
    });

    match section {
        Some(sh) => {
            let code = file_range(sh.sh_offset, sh.sh_size, buffer.len())?;
            Ok(ResolvedEntry {
                offset: (entry - sh.sh_addr) as usize,
                code,
                format,
            })
        }
        None => Err(LoaderError::NoEntry(format!(
            "ELF entry 0x{:x} is not inside any executable segment or section",
            entry
        ))),
    }
}

fn file_range(offset: u64, size: u64, len: usize) -> Result<std::ops::Range<usize>> {
    let start = offset as usize;
    let end = start
        .checked_add(size as usize)
        .filter(|&end| end <= len)
        .ok_or_else(|| {
            LoaderError::NoEntry(format!(
                "code at 0x{:x}+0x{:x} extends past the end of the file",
                offset, size
            ))
        })?;
    Ok(start..end)
}
