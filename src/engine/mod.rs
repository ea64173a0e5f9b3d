//! Execution engine: one [`Executor`] per strategy
//!
//! The selector's output picks the implementation through [`executor_for`]; every
//! implementation owns its OS resources through values whose `Drop` releases them, so
//! an error or cancellation at any step still tears everything down.

pub mod cancel;
pub mod child;
pub mod emulator;
pub mod inject;
pub mod native;
pub mod relocate;
pub mod runner;
#[cfg(windows)]
pub mod win32;

use std::path::Path;

use serde::Serialize;

use self::cancel::WaitPolicy;
use crate::error::Result;
use crate::image::loader::ShellcodeImage;
use crate::strategy::config::LoaderConfig;
use crate::strategy::selector::{ExecutionStrategy, Target};

/// Exit status collected from a payload thread or process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ExitCode(pub u32);

impl ExitCode {
    /// Value to hand to `std::process::exit`
    pub fn as_process_code(self) -> i32 {
        self.0 as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything an executor needs besides the image
pub struct ExecutionContext<'a> {
    pub target: Target<'a>,
    pub config: &'a LoaderConfig,
    pub wait: WaitPolicy,
    /// Path the image was loaded from, if any
    pub source: Option<&'a Path>,
}

/// A way of running a shellcode image to completion
pub trait Executor {
    /// The strategy this executor implements
    fn strategy(&self) -> ExecutionStrategy;

    /// Run the image and return its exit status. The image is consumed.
    fn execute(&self, image: ShellcodeImage, ctx: &ExecutionContext<'_>) -> Result<ExitCode>;
}

/// The executor implementing `strategy` on this platform
pub fn executor_for(strategy: ExecutionStrategy) -> Result<Box<dyn Executor>> {
    match strategy {
        ExecutionStrategy::NativeDirect => Ok(Box::new(native::NativeExecutor)),
        ExecutionStrategy::LocalRelocate => Ok(Box::new(relocate::RelocateExecutor)),
        ExecutionStrategy::Emulate => Ok(Box::new(emulator::EmulatorExecutor)),
        ExecutionStrategy::RemoteInject | ExecutionStrategy::RemoteInjectCrossFamily => {
            injection_executor(strategy)
        }
    }
}

#[cfg(windows)]
fn injection_executor(strategy: ExecutionStrategy) -> Result<Box<dyn Executor>> {
    Ok(Box::new(inject::InjectionExecutor::new(
        win32::Win32Api,
        strategy == ExecutionStrategy::RemoteInjectCrossFamily,
    )))
}

#[cfg(not(windows))]
fn injection_executor(strategy: ExecutionStrategy) -> Result<Box<dyn Executor>> {
    Err(crate::error::LoaderError::UnsupportedTarget(format!(
        "{} requires a Windows host",
        strategy
    )))
}
