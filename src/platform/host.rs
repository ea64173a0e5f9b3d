//! Host profiling: which OS, CPU family and bit width this machine runs

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use super::catalog::{Bitness, CpuFamily};

/// Operating system a target is built for or a host runs
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OperatingSystem {
    Windows,
    Linux,
    MacOs,
    Other,
}

impl OperatingSystem {
    /// The OS this binary was built for
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => OperatingSystem::Windows,
            "linux" | "android" => OperatingSystem::Linux,
            "macos" => OperatingSystem::MacOs,
            _ => OperatingSystem::Other,
        }
    }
}

/// The running machine, as far as strategy selection is concerned
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    pub os: OperatingSystem,
    pub family: CpuFamily,
    pub bits: Bitness,
}

impl HostProfile {
    /// Profile the machine this process runs on.
    ///
    /// The native machine is reported, not the loader's own build: a 32-bit loader on a
    /// 64-bit kernel still yields a 64-bit profile.
    pub fn detect() -> Self {
        let os = OperatingSystem::current();
        let machine = native_machine().unwrap_or_else(|| std::env::consts::ARCH.to_string());
        log::debug!("Host machine identifier: {}", machine);
        Self::from_machine(os, &machine)
    }

    /// Classify a machine identifier such as `uname -m` output or a Windows
    /// `PROCESSOR_ARCHITECTURE` value.
    ///
    /// Unrecognized identifiers yield `CpuFamily::Unknown` with a 64-bit default.
    pub fn from_machine(os: OperatingSystem, machine: &str) -> Self {
        let (family, bits) = match machine.to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => (CpuFamily::X86, Bitness::Bits64),
            "i386" | "i486" | "i586" | "i686" | "x86" => (CpuFamily::X86, Bitness::Bits32),
            "aarch64" | "arm64" | "aarch64_be" => (CpuFamily::Arm, Bitness::Bits64),
            m if m.starts_with("arm") => (CpuFamily::Arm, Bitness::Bits32),
            other => {
                log::warn!(
                    "Unrecognized host machine '{}', assuming unknown 64-bit CPU",
                    other
                );
                (CpuFamily::Unknown, Bitness::Bits64)
            }
        };

        Self { os, family, bits }
    }
}

/// Pointer width of the loader process itself
pub fn running_bits() -> Bitness {
    if cfg!(target_pointer_width = "64") {
        Bitness::Bits64
    } else {
        Bitness::Bits32
    }
}

#[cfg(unix)]
fn native_machine() -> Option<String> {
    use std::ffi::CStr;

    // SAFETY: utsname is plain data and uname fills it in completely on success
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let machine = unsafe { CStr::from_ptr(uts.machine.as_ptr()) };
    Some(machine.to_string_lossy().into_owned())
}

#[cfg(windows)]
fn native_machine() -> Option<String> {
    use crate::platform::catalog::pe_machine;
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, IsWow64Process2};

    let mut process_machine: u16 = 0;
    let mut native: u16 = 0;
    let ok = unsafe { IsWow64Process2(GetCurrentProcess(), &mut process_machine, &mut native) };
    if ok != 0 {
        let name = match native {
            pe_machine::AMD64 => Some("amd64"),
            pe_machine::I386 => Some("x86"),
            pe_machine::ARM64 => Some("arm64"),
            pe_machine::ARMNT => Some("arm"),
            _ => None,
        };
        if let Some(name) = name {
            return Some(name.to_string());
        }
    }

    // WOW64 processes see the native architecture in PROCESSOR_ARCHITEW6432
    std::env::var("PROCESSOR_ARCHITEW6432")
        .or_else(|_| std::env::var("PROCESSOR_ARCHITECTURE"))
        .ok()
}

#[cfg(not(any(unix, windows)))]
fn native_machine() -> Option<String> {
    None
}
