//! Child process ownership for the container and emulator strategies

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use super::cancel::WaitPolicy;
use super::ExitCode;
use crate::error::{LoaderError, Result};

/// A spawned child that is killed and reaped if dropped before it exits
pub struct ChildGuard {
    child: Option<Child>,
    label: String,
}

impl ChildGuard {
    /// Spawn `program` with `args`, inheriting the console
    pub fn spawn<S: AsRef<std::ffi::OsStr>>(program: &Path, args: &[S]) -> Result<Self> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                LoaderError::ProcessCreation(format!("{}: {}", program.display(), e))
            })?;

        log::debug!("Spawned {} (pid {})", program.display(), child.id());
        Ok(Self {
            child: Some(child),
            label: program.display().to_string(),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Block until the child exits or `wait` says stop
    pub fn wait(mut self, wait: &WaitPolicy) -> Result<ExitCode> {
        let status = wait.wait_until(|slice| {
            let child = self
                .child
                .as_mut()
                .ok_or_else(|| LoaderError::Execution("child already reaped".to_string()))?;
            match child.try_wait()? {
                Some(status) => Ok(Some(status)),
                None => {
                    std::thread::sleep(slice);
                    Ok(None)
                }
            }
        })?;

        self.child = None;
        log::debug!("{} exited with {}", self.label, status);
        Ok(exit_code(status))
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            log::debug!("Killing {} (pid {})", self.label, child.id());
            if let Err(e) = child.kill() {
                log::warn!("Failed to kill {}: {}", self.label, e);
            }
            if let Err(e) = child.wait() {
                log::warn!("Failed to reap {}: {}", self.label, e);
            }
        }
    }
}

/// Exit code of a finished child; signals map to 128 + signal number
pub fn exit_code(status: ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        return ExitCode(code as u32);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitCode(128 + signal as u32);
        }
    }

    ExitCode(1)
}
