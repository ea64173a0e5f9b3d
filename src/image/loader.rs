//! Shellcode image loading for raw blobs and ELF/PE containers

use std::ops::Range;
use std::path::Path;

use goblin::Object;
use serde::Serialize;

use super::elf::resolve_elf;
use super::pe::resolve_pe;
use crate::error::{LoaderError, Result};

/// How the input file should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputFormat {
    /// Container if the bytes parse as ELF or PE, raw blob otherwise
    #[default]
    Auto,
    /// Always a raw blob entered at byte 0
    Raw,
    /// Must be an ELF or PE container
    Container,
}

/// Where the image bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceFormat {
    Raw,
    Elf { machine: u16 },
    Pe { machine: u16 },
}

/// Result of entry resolution on a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    /// Entry offset relative to the start of `code`
    pub offset: usize,
    /// File range of the code-bearing segment or section
    pub code: Range<usize>,
    /// Container kind and machine
    pub format: SourceFormat,
}

/// Position-independent code plus the offset execution starts at
#[derive(Debug, Clone)]
pub struct ShellcodeImage {
    bytes: Vec<u8>,
    entry_offset: usize,
    format: SourceFormat,
}

impl ShellcodeImage {
    /// Create an image, enforcing `entry_offset < bytes.len()`
    pub fn new(bytes: Vec<u8>, entry_offset: usize, format: SourceFormat) -> Result<Self> {
        if bytes.is_empty() {
            return Err(LoaderError::InvalidImage("shellcode is empty".to_string()));
        }
        if entry_offset >= bytes.len() {
            return Err(LoaderError::NoEntry(format!(
                "entry offset 0x{:x} lies outside the {}-byte image",
                entry_offset,
                bytes.len()
            )));
        }

        Ok(Self {
            bytes,
            entry_offset,
            format,
        })
    }

    /// A raw blob entered at its first byte
    pub fn raw(bytes: Vec<u8>) -> Result<Self> {
        Self::new(bytes, 0, SourceFormat::Raw)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn entry_offset(&self) -> usize {
        self.entry_offset
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false for a constructed image; present for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn format(&self) -> SourceFormat {
        self.format
    }

    /// Bytes from the entry point onward
    pub fn entry_bytes(&self) -> &[u8] {
        &self.bytes[self.entry_offset..]
    }
}

/// Parse an ELF or PE container and locate its entry point
pub fn resolve(buffer: &[u8], strict_entry: bool) -> Result<ResolvedEntry> {
    let object = Object::parse(buffer)
        .map_err(|e| LoaderError::NoEntry(format!("unparseable container: {}", e)))?;

    match object {
        Object::Elf(elf) => resolve_elf(&elf, buffer),
        Object::PE(pe) => resolve_pe(&pe, buffer, strict_entry),
        Object::Mach(_) => Err(LoaderError::NoEntry(
            "Mach-O containers are not supported".to_string(),
        )),
        Object::Archive(_) => Err(LoaderError::NoEntry(
            "archive files are not supported".to_string(),
        )),
        _ => Err(LoaderError::NoEntry("unknown container format".to_string())),
    }
}

/// Load a shellcode file
pub fn load_image(path: &Path, format: InputFormat, strict_entry: bool) -> Result<ShellcodeImage> {
    if !path.exists() {
        return Err(LoaderError::InvalidImage(format!(
            "shellcode file not found: {}",
            path.display()
        )));
    }
    let buffer = std::fs::read(path)?;
    load_image_from_bytes(buffer, format, strict_entry)
}

/// Build an image from raw bytes
pub fn load_image_from_bytes(
    buffer: Vec<u8>,
    format: InputFormat,
    strict_entry: bool,
) -> Result<ShellcodeImage> {
    if buffer.is_empty() {
        return Err(LoaderError::InvalidImage("shellcode file is empty".to_string()));
    }

    let resolved = match format {
        InputFormat::Raw => None,
        InputFormat::Container => Some(resolve(&buffer, strict_entry)?),
        InputFormat::Auto if looks_like_container(&buffer) => {
            match resolve(&buffer, strict_entry) {
                Ok(entry) => Some(entry),
                // Only bytes goblin cannot parse may fall back to a raw blob
                Err(e) if Object::parse(&buffer).is_ok() => return Err(e),
                Err(e) => {
                    log::debug!("Container magic present but not loadable ({}), treating as raw", e);
                    None
                }
            }
        }
        InputFormat::Auto => None,
    };

    match resolved {
        Some(entry) => {
            log::debug!(
                "Resolved {:?} entry at offset 0x{:x} in code range {:?}",
                entry.format,
                entry.offset,
                entry.code
            );
            let code = buffer[entry.code.clone()].to_vec();
            ShellcodeImage::new(code, entry.offset, entry.format)
        }
        None => ShellcodeImage::raw(buffer),
    }
}

fn looks_like_container(buffer: &[u8]) -> bool {
    buffer.starts_with(b"\x7fELF") || buffer.starts_with(b"MZ")
}
