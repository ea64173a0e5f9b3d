//! In-process execution
//!
//! The image is copied into a freshly mapped read-write region, the region is switched
//! to read-execute, and a new thread starts at `base + entry_offset`. The thread's
//! return value is the exit code.

use super::{ExecutionContext, Executor, ExitCode};
use crate::error::Result;
use crate::image::loader::ShellcodeImage;
use crate::strategy::selector::ExecutionStrategy;

/// Executor for [`ExecutionStrategy::NativeDirect`]
pub struct NativeExecutor;

impl Executor for NativeExecutor {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::NativeDirect
    }

    fn execute(&self, image: ShellcodeImage, ctx: &ExecutionContext<'_>) -> Result<ExitCode> {
        log::info!(
            "Executing {} bytes in-process (entry +0x{:x})",
            image.len(),
            image.entry_offset()
        );
        imp::run(image, &ctx.wait)
    }
}

/// Run `image` on a new thread of this process, without an [`ExecutionContext`]
pub fn run(image: ShellcodeImage, wait: &super::cancel::WaitPolicy) -> Result<ExitCode> {
    imp::run(image, wait)
}

#[cfg(unix)]
mod imp {
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::thread;

    use memmap2::{Mmap, MmapOptions};

    use crate::engine::cancel::WaitPolicy;
    use crate::engine::ExitCode;
    use crate::error::{LoaderError, Result};
    use crate::image::loader::ShellcodeImage;

    type Entry = extern "C" fn() -> u32;

    /// Anonymous mapping holding the image, read-execute once populated
    pub(super) struct ExecutableRegion {
        map: Mmap,
    }

    impl ExecutableRegion {
        pub(super) fn new(bytes: &[u8]) -> Result<Self> {
            let mut map = MmapOptions::new()
                .len(bytes.len())
                .map_anon()
                .map_err(|e| LoaderError::Allocation(format!("mmap {} bytes: {}", bytes.len(), e)))?;
            map.copy_from_slice(bytes);

            let map = map
                .make_exec()
                .map_err(|e| LoaderError::Allocation(format!("mprotect to read-execute: {}", e)))?;

            log::debug!("Mapped {} bytes at {:p}", bytes.len(), map.as_ptr());
            Ok(Self { map })
        }

        pub(super) fn address(&self, offset: usize) -> usize {
            self.map.as_ptr() as usize + offset
        }
    }

    impl Drop for ExecutableRegion {
        fn drop(&mut self) {
            log::debug!("Unmapping {} bytes at {:p}", self.map.len(), self.map.as_ptr());
        }
    }

    pub(super) fn run(image: ShellcodeImage, wait: &WaitPolicy) -> Result<ExitCode> {
        let region = ExecutableRegion::new(image.bytes())?;
        let entry = region.address(image.entry_offset());
        drop(image);

        let (tx, rx) = mpsc::channel();

        // The payload thread owns the mapping, so it can never be unmapped under code
        // that is still running, even when the wait below is abandoned
        let handle = thread::Builder::new()
            .name("shellcode".to_string())
            .spawn(move || {
                // SAFETY: `entry` points into `region`, which is executable and alive
                // for the duration of the call
                let func: Entry = unsafe { std::mem::transmute::<usize, Entry>(entry) };
                let code = func();
                drop(region);
                let _ = tx.send(code);
            })
            .map_err(|e| LoaderError::Execution(format!("thread creation failed: {}", e)))?;

        let result = wait.wait_until(|slice| match rx.recv_timeout(slice) {
            Ok(code) => Ok(Some(code)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(LoaderError::Execution(
                "payload thread ended without returning".to_string(),
            )),
        });

        match result {
            Ok(code) => {
                let _ = handle.join();
                Ok(ExitCode(code))
            }
            Err(e) => {
                log::warn!("Abandoning payload thread; its mapping is released when it returns");
                Err(e)
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::ffi::c_void;
    use std::ptr::{null, null_mut};
    use std::time::Duration;

    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_READWRITE,
    };
    use windows_sys::Win32::System::Threading::{CreateThread, GetExitCodeThread, TerminateThread};

    use crate::engine::cancel::{CancelToken, WaitPolicy};
    use crate::engine::win32::{start_routine, wait_handle, HandleGuard};
    use crate::engine::ExitCode;
    use crate::error::{LoaderError, Result};
    use crate::image::loader::ShellcodeImage;

    /// `VirtualAlloc` region released with `MEM_RELEASE` on drop
    pub(super) struct ExecutableRegion {
        base: *mut c_void,
        size: usize,
    }

    impl ExecutableRegion {
        pub(super) fn new(bytes: &[u8]) -> Result<Self> {
            let size = bytes.len();
            let base = unsafe { VirtualAlloc(null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
            if base.is_null() {
                return Err(LoaderError::last_os(LoaderError::Allocation, "VirtualAlloc"));
            }
            let region = Self { base, size };

            // SAFETY: `base` is a fresh read-write allocation of exactly `size` bytes
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), base as *mut u8, size) };

            let mut old = 0;
            if unsafe { VirtualProtect(base, size, PAGE_EXECUTE_READ, &mut old) } == 0 {
                return Err(LoaderError::last_os(LoaderError::Allocation, "VirtualProtect"));
            }

            log::debug!("Allocated {} bytes at {:p}", size, base);
            Ok(region)
        }

        pub(super) fn address(&self, offset: usize) -> usize {
            self.base as usize + offset
        }
    }

    impl Drop for ExecutableRegion {
        fn drop(&mut self) {
            if unsafe { VirtualFree(self.base, 0, MEM_RELEASE) } == 0 {
                log::warn!(
                    "VirtualFree of {} bytes at {:p} failed: {}",
                    self.size,
                    self.base,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    pub(super) fn run(image: ShellcodeImage, wait: &WaitPolicy) -> Result<ExitCode> {
        let region = ExecutableRegion::new(image.bytes())?;
        let entry = region.address(image.entry_offset());

        let handle = unsafe {
            CreateThread(null(), 0, start_routine(entry), null(), 0, null_mut())
        };
        if handle.is_null() {
            return Err(LoaderError::last_os(LoaderError::Execution, "CreateThread"));
        }
        let thread = HandleGuard::new(handle);

        if let Err(e) = wait_handle(&thread, wait) {
            // The region is freed after this; the thread must not outlive it
            unsafe { TerminateThread(thread.raw(), 1) };
            let settle = WaitPolicy::new(CancelToken::new(), Some(Duration::from_secs(5)));
            if let Err(settle_err) = wait_handle(&thread, &settle) {
                log::warn!("Terminated payload thread did not exit: {}", settle_err);
            }
            return Err(e);
        }

        let mut code = 0u32;
        if unsafe { GetExitCodeThread(thread.raw(), &mut code) } == 0 {
            return Err(LoaderError::last_os(LoaderError::Execution, "GetExitCodeThread"));
        }

        drop(thread);
        drop(region);
        Ok(ExitCode(code))
    }
}
