//! Architecture catalog: the fixed set of targets the loader knows how to run

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::error::{LoaderError, Result};

/// Instruction-set family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CpuFamily {
    X86,
    Arm,
    /// Host machine identifier was not recognized
    Unknown,
}

/// Pointer width a process image is created for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Bitness {
    Bits32,
    Bits64,
}

impl Bitness {
    /// Width in bits
    pub fn bits(self) -> u32 {
        match self {
            Bitness::Bits32 => 32,
            Bitness::Bits64 => 64,
        }
    }
}

impl std::fmt::Display for Bitness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

impl TryFrom<u32> for Bitness {
    type Error = String;

    fn try_from(bits: u32) -> std::result::Result<Self, Self::Error> {
        match bits {
            32 => Ok(Bitness::Bits32),
            64 => Ok(Bitness::Bits64),
            other => Err(format!("unsupported bit width {}", other)),
        }
    }
}

impl From<Bitness> for u32 {
    fn from(bitness: Bitness) -> u32 {
        bitness.bits()
    }
}

/// ELF `e_machine` values for the built-in targets
pub mod elf_machine {
    pub const EM_386: u16 = 3;
    pub const EM_ARM: u16 = 40;
    pub const EM_X86_64: u16 = 62;
    pub const EM_AARCH64: u16 = 183;
}

/// PE `Machine` values for the built-in targets
pub mod pe_machine {
    pub const I386: u16 = 0x014c;
    pub const ARMNT: u16 = 0x01c4;
    pub const AMD64: u16 = 0x8664;
    pub const ARM64: u16 = 0xaa64;
}

/// One supported target architecture
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureDescriptor {
    /// Canonical name (e.g., "x86_64")
    pub name: String,
    /// Alternative spellings accepted on lookup
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Pointer width of code built for this target
    pub bits: Bitness,
    /// Instruction-set family
    pub family: CpuFamily,
    /// User-mode emulator binaries, in preference order
    #[serde(default)]
    pub emulators: Vec<String>,
    /// Windows host executables suitable for injection, in preference order
    #[serde(default)]
    pub injection_hosts: Vec<PathBuf>,
    /// ELF machine identifier used when building containers
    pub elf_machine: u16,
    /// PE machine identifier passed to the OS loader for cross-family injection
    pub pe_machine: u16,
}

impl ArchitectureDescriptor {
    /// Whether `name` refers to this descriptor, ignoring ASCII case
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn paths(items: &[&str]) -> Vec<PathBuf> {
    items.iter().map(PathBuf::from).collect()
}

/// Immutable table of known targets
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Catalog {
    pub targets: Vec<ArchitectureDescriptor>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalog {
    /// The targets supported out of the box
    pub fn builtin() -> Self {
        let targets = vec![
            ArchitectureDescriptor {
                name: "i386".to_string(),
                aliases: strings(&["x86", "i686"]),
                bits: Bitness::Bits32,
                family: CpuFamily::X86,
                emulators: strings(&["qemu-i386", "qemu-i386-static"]),
                injection_hosts: paths(&[
                    r"C:\Windows\SysWOW64\cmd.exe",
                    r"C:\Windows\SysWOW64\conhost.exe",
                ]),
                elf_machine: elf_machine::EM_386,
                pe_machine: pe_machine::I386,
            },
            ArchitectureDescriptor {
                name: "x86_64".to_string(),
                aliases: strings(&["amd64", "x64"]),
                bits: Bitness::Bits64,
                family: CpuFamily::X86,
                emulators: strings(&["qemu-x86_64", "qemu-x86_64-static"]),
                injection_hosts: paths(&[
                    r"C:\Windows\System32\cmd.exe",
                    r"C:\Windows\System32\conhost.exe",
                ]),
                elf_machine: elf_machine::EM_X86_64,
                pe_machine: pe_machine::AMD64,
            },
            ArchitectureDescriptor {
                name: "armv7a".to_string(),
                aliases: strings(&["arm", "armv7", "armhf"]),
                bits: Bitness::Bits32,
                family: CpuFamily::Arm,
                emulators: strings(&["qemu-arm", "qemu-arm-static"]),
                // Windows dropped 32-bit ARM user mode, nothing to inject into
                injection_hosts: Vec::new(),
                elf_machine: elf_machine::EM_ARM,
                pe_machine: pe_machine::ARMNT,
            },
            ArchitectureDescriptor {
                name: "aarch64".to_string(),
                aliases: strings(&["arm64"]),
                bits: Bitness::Bits64,
                family: CpuFamily::Arm,
                emulators: strings(&["qemu-aarch64", "qemu-aarch64-static"]),
                injection_hosts: paths(&[
                    r"C:\Windows\System32\cmd.exe",
                    r"C:\Windows\System32\conhost.exe",
                ]),
                elf_machine: elf_machine::EM_AARCH64,
                pe_machine: pe_machine::ARM64,
            },
        ];

        Self { targets }
    }

    /// Parse a catalog from JSON, replacing the built-in table
    pub fn from_json(text: &str) -> Result<Self> {
        let catalog: Catalog =
            serde_json::from_str(text).map_err(|e| LoaderError::Catalog(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a JSON catalog file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(LoaderError::Catalog("catalog has no targets".to_string()));
        }

        for (i, target) in self.targets.iter().enumerate() {
            let names = std::iter::once(&target.name).chain(target.aliases.iter());
            for name in names {
                let clash = self.targets[..i].iter().find(|other| other.matches(name));
                if let Some(other) = clash {
                    return Err(LoaderError::Catalog(format!(
                        "name '{}' of '{}' is already used by '{}'",
                        name, target.name, other.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Find a target by canonical name or alias
    pub fn lookup(&self, name: &str) -> Result<&ArchitectureDescriptor> {
        self.targets
            .iter()
            .find(|t| t.matches(name))
            .ok_or_else(|| LoaderError::UnknownArchitecture {
                name: name.to_string(),
                known: self.names().join(", "),
            })
    }

    /// Canonical names of all targets
    pub fn names(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArchitectureDescriptor> {
        self.targets.iter()
    }
}
