//! Execution strategy selection

use serde::Serialize;
use strum::{Display, EnumIter};

use crate::error::{LoaderError, Result};
use crate::platform::catalog::{ArchitectureDescriptor, Bitness};
use crate::platform::host::{HostProfile, OperatingSystem};

/// How a payload gets onto a CPU that can run it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, Serialize)]
pub enum ExecutionStrategy {
    /// Executable memory and a thread inside the loader process
    NativeDirect,
    /// A kernel-loaded container of the target bit width, run as a child process
    LocalRelocate,
    /// A suspended host process of the target bit width, injected with the payload
    RemoteInject,
    /// Like `RemoteInject`, with the OS loader told to build a process of the target
    /// instruction set
    RemoteInjectCrossFamily,
    /// A user-mode CPU emulator running a container
    Emulate,
}

impl ExecutionStrategy {
    /// Whether the strategy runs the payload inside a second process it injects into
    pub fn is_injection(self) -> bool {
        matches!(
            self,
            ExecutionStrategy::RemoteInject | ExecutionStrategy::RemoteInjectCrossFamily
        )
    }
}

/// A catalog entry paired with the OS the payload was built for
#[derive(Clone, Copy, Debug)]
pub struct Target<'a> {
    pub arch: &'a ArchitectureDescriptor,
    pub os: OperatingSystem,
}

impl<'a> Target<'a> {
    pub fn new(arch: &'a ArchitectureDescriptor, os: OperatingSystem) -> Self {
        Self { arch, os }
    }
}

/// Choose the strategy for running `target` on `host` from a loader process of
/// `running_bits` width.
///
/// Only an OS mismatch is rejected; every other combination has a strategy, and the
/// ones nothing can run degrade to emulation.
pub fn select(
    host: &HostProfile,
    target: &Target<'_>,
    running_bits: Bitness,
) -> Result<ExecutionStrategy> {
    if target.os != host.os {
        return Err(LoaderError::UnsupportedTarget(format!(
            "{} {} payloads cannot run on a {} host",
            target.os, target.arch.name, host.os
        )));
    }

    let same_family = target.arch.family == host.family;
    let target_bits = target.arch.bits;

    let strategy = match host.os {
        OperatingSystem::Windows => {
            if !same_family {
                ExecutionStrategy::RemoteInjectCrossFamily
            } else if running_bits == target_bits {
                ExecutionStrategy::NativeDirect
            } else {
                ExecutionStrategy::RemoteInject
            }
        }
        _ => match (same_family, target_bits, host.bits) {
            (true, t, h) if t == h && running_bits == t => ExecutionStrategy::NativeDirect,
            (true, t, h) if t == h => ExecutionStrategy::LocalRelocate,
            (true, Bitness::Bits32, Bitness::Bits64) => ExecutionStrategy::LocalRelocate,
            _ => ExecutionStrategy::Emulate,
        },
    };

    log::debug!(
        "Host {} {} {}, running {}, target {} ({} {}) -> {}",
        host.os,
        host.family,
        host.bits,
        running_bits,
        target.arch.name,
        target.arch.family,
        target_bits,
        strategy
    );

    Ok(strategy)
}
