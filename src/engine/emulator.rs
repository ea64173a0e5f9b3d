//! Emulator launcher: runs a container under a user-mode CPU emulator

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use super::cancel::WaitPolicy;
use super::child::ChildGuard;
use super::{ExecutionContext, Executor, ExitCode};
use crate::error::{LoaderError, Result};
use crate::image::container::prepare_container;
use crate::image::loader::ShellcodeImage;
use crate::strategy::selector::ExecutionStrategy;

/// Find the first candidate present on `search_path`
pub fn locate(candidates: &[String], search_path: &OsStr) -> Result<PathBuf> {
    let dirs: Vec<PathBuf> = std::env::split_paths(search_path).collect();

    for name in candidates {
        for dir in &dirs {
            for file in executable_names(name) {
                let path = dir.join(&file);
                if is_executable(&path) {
                    log::debug!("Found emulator {}", path.display());
                    return Ok(path);
                }
            }
        }
    }

    Err(LoaderError::EmulatorNotFound {
        tried: candidates.to_vec(),
    })
}

#[cfg(windows)]
fn executable_names(name: &str) -> Vec<String> {
    vec![format!("{}.exe", name), name.to_string()]
}

#[cfg(not(windows))]
fn executable_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Run `container` under the first available emulator and return its exit code
/// unchanged. The emulator inherits the console.
pub fn launch(
    container: &Path,
    candidates: &[String],
    search_path: &OsStr,
    wait: &WaitPolicy,
) -> Result<ExitCode> {
    let emulator = locate(candidates, search_path)?;
    log::info!(
        "Emulating {} with {}",
        container.display(),
        emulator.display()
    );

    ChildGuard::spawn(&emulator, &[container])?.wait(wait)
}

/// Executor for [`ExecutionStrategy::Emulate`]
pub struct EmulatorExecutor;

impl Executor for EmulatorExecutor {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Emulate
    }

    fn execute(&self, image: ShellcodeImage, ctx: &ExecutionContext<'_>) -> Result<ExitCode> {
        let arch = ctx.target.arch;
        let search_path = ctx.config.effective_search_path();

        // Fail on a missing emulator before writing any container
        locate(&arch.emulators, &search_path)?;

        let container = prepare_container(&image, arch, ctx.source)?;
        launch(container.path(), &arch.emulators, &search_path, &ctx.wait)
    }
}
