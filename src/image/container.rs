//! Minimal ELF container builder for kernel-loaded and emulated execution
//!
//! The produced image has a single RWX `PT_LOAD` segment covering the whole file,
//! mapped at [`LOAD_BASE`], with the entry point at the shellcode's entry offset.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempPath;

use super::loader::{ShellcodeImage, SourceFormat};
use crate::error::Result;
use crate::platform::catalog::{elf_machine, ArchitectureDescriptor, Bitness};

/// Virtual address the container's segment is loaded at
pub const LOAD_BASE: u64 = 0x40_0000;

const PF_RWX: u32 = 0x7;
const PT_LOAD: u32 = 1;
const ET_EXEC: u16 = 2;
const EF_ARM_EABI_VER5: u32 = 0x0500_0000;

/// Size of the ELF and program headers preceding the code
pub fn header_len(bits: Bitness) -> usize {
    match bits {
        Bitness::Bits32 => 52 + 32,
        Bitness::Bits64 => 64 + 56,
    }
}

/// Build a static ELF whose entry point is `LOAD_BASE + headers + entry_offset`
pub fn build_elf(image: &ShellcodeImage, arch: &ArchitectureDescriptor) -> Vec<u8> {
    let headers = header_len(arch.bits);
    let total = (headers + image.len()) as u64;
    let entry = LOAD_BASE + (headers + image.entry_offset()) as u64;
    let flags = if arch.elf_machine == elf_machine::EM_ARM {
        EF_ARM_EABI_VER5
    } else {
        0
    };

    let shentsize: u16 = match arch.bits {
        Bitness::Bits32 => 40,
        Bitness::Bits64 => 64,
    };

    let mut out = Vec::with_capacity(total as usize);
    let class = match arch.bits {
        Bitness::Bits32 => 1u8,
        Bitness::Bits64 => 2u8,
    };

    // e_ident: magic, class, little-endian, version 1, System V ABI
    out.extend_from_slice(b"\x7fELF");
    out.extend_from_slice(&[class, 1, 1, 0]);
    out.extend_from_slice(&[0u8; 8]);

    out.extend_from_slice(&ET_EXEC.to_le_bytes());
    out.extend_from_slice(&arch.elf_machine.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());

    match arch.bits {
        Bitness::Bits32 => {
            out.extend_from_slice(&(entry as u32).to_le_bytes());
            out.extend_from_slice(&52u32.to_le_bytes()); // e_phoff
            out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&52u16.to_le_bytes()); // e_ehsize
            out.extend_from_slice(&32u16.to_le_bytes()); // e_phentsize
        }
        Bitness::Bits64 => {
            out.extend_from_slice(&entry.to_le_bytes());
            out.extend_from_slice(&64u64.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&64u16.to_le_bytes());
            out.extend_from_slice(&56u16.to_le_bytes());
        }
    }
    out.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&shentsize.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    match arch.bits {
        Bitness::Bits32 => {
            out.extend_from_slice(&PT_LOAD.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // p_offset
            out.extend_from_slice(&(LOAD_BASE as u32).to_le_bytes()); // p_vaddr
            out.extend_from_slice(&(LOAD_BASE as u32).to_le_bytes()); // p_paddr
            out.extend_from_slice(&(total as u32).to_le_bytes()); // p_filesz
            out.extend_from_slice(&(total as u32).to_le_bytes()); // p_memsz
            out.extend_from_slice(&PF_RWX.to_le_bytes());
            out.extend_from_slice(&0x1000u32.to_le_bytes()); // p_align
        }
        Bitness::Bits64 => {
            out.extend_from_slice(&PT_LOAD.to_le_bytes());
            out.extend_from_slice(&PF_RWX.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes());
            out.extend_from_slice(&LOAD_BASE.to_le_bytes());
            out.extend_from_slice(&LOAD_BASE.to_le_bytes());
            out.extend_from_slice(&total.to_le_bytes());
            out.extend_from_slice(&total.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
        }
    }

    debug_assert_eq!(out.len(), headers);
    out.extend_from_slice(image.bytes());
    out
}

/// An ELF on disk ready to be handed to the kernel or an emulator
#[derive(Debug)]
pub enum ContainerFile {
    /// The user's own ELF input, read in place by an emulator
    Existing(PathBuf),
    /// A private executable copy, deleted on drop
    Generated(TempPath),
}

impl ContainerFile {
    pub fn path(&self) -> &Path {
        match self {
            ContainerFile::Existing(path) => path.as_path(),
            ContainerFile::Generated(path) => path,
        }
    }
}

/// Produce an ELF for an emulator to load.
///
/// An ELF input is referenced in place by its absolute path, since the emulator only
/// reads it. Raw blobs and PE code sections are wrapped with [`build_elf`] into a
/// temporary file that is removed when the result is dropped.
pub fn prepare_container(
    image: &ShellcodeImage,
    arch: &ArchitectureDescriptor,
    source: Option<&Path>,
) -> Result<ContainerFile> {
    if let (SourceFormat::Elf { .. }, Some(path)) = (image.format(), source) {
        let path = std::fs::canonicalize(path)?;
        log::debug!("Using ELF input {} directly", path.display());
        return Ok(ContainerFile::Existing(path));
    }

    write_container(&build_elf(image, arch), arch)
}

/// Produce an ELF the kernel can exec.
///
/// The result is always a generated file with the execute bit set. An ELF input is
/// copied byte for byte, so its own mode and location do not matter.
pub fn prepare_executable(
    image: &ShellcodeImage,
    arch: &ArchitectureDescriptor,
    source: Option<&Path>,
) -> Result<ContainerFile> {
    let bytes = match (image.format(), source) {
        (SourceFormat::Elf { .. }, Some(path)) => {
            log::debug!("Copying ELF input {} for exec", path.display());
            std::fs::read(path)?
        }
        _ => build_elf(image, arch),
    };

    write_container(&bytes, arch)
}

fn write_container(bytes: &[u8], arch: &ArchitectureDescriptor) -> Result<ContainerFile> {
    let mut file = tempfile::Builder::new()
        .prefix("shellhost-")
        .suffix(".elf")
        .tempfile()?;
    file.write_all(bytes)?;

    // The writable descriptor must be closed before exec, or the kernel reports ETXTBSY
    let path = file.into_temp_path();
    make_executable(&path)?;

    log::debug!(
        "Wrote {}-byte {} container to {}",
        bytes.len(),
        arch.name,
        path.display()
    );
    Ok(ContainerFile::Generated(path))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
