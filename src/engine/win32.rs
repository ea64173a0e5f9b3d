//! Win32 implementation of the injection protocol and shared handle helpers

use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr::{null, null_mut};
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows_sys::Win32::System::Memory::{
    VirtualAllocEx, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
};
use windows_sys::Win32::System::Threading::{
    CreateProcessW, CreateRemoteThread, DeleteProcThreadAttributeList, GetExitCodeThread,
    InitializeProcThreadAttributeList, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject, CREATE_SUSPENDED, EXTENDED_STARTUPINFO_PRESENT,
    LPPROC_THREAD_ATTRIBUTE_LIST, LPTHREAD_START_ROUTINE, PROCESS_INFORMATION, STARTUPINFOEXW,
    STARTUPINFOW,
};

use super::cancel::WaitPolicy;
use super::inject::{ProcessApi, RemoteRegion, WaitOutcome};
use crate::error::{LoaderError, Result};

/// `ProcThreadAttributeValue(25, FALSE, TRUE, FALSE)`: machine type of the new process
const PROC_THREAD_ATTRIBUTE_MACHINE_TYPE: usize = 0x0002_0019;

/// Owned kernel handle closed on drop
pub struct HandleGuard(HANDLE);

impl HandleGuard {
    pub fn new(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }

    fn is_valid(&self) -> bool {
        !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE
    }

    /// Close now, reporting failure instead of logging it
    pub fn close(mut self) -> Result<()> {
        let handle = std::mem::replace(&mut self.0, null_mut());
        if !handle.is_null() && handle != INVALID_HANDLE_VALUE && unsafe { CloseHandle(handle) } == 0 {
            return Err(LoaderError::last_os(LoaderError::Execution, "CloseHandle"));
        }
        Ok(())
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.is_valid() && unsafe { CloseHandle(self.0) } == 0 {
            log::warn!("CloseHandle failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// Thread start routine at an absolute address
pub fn start_routine(address: usize) -> LPTHREAD_START_ROUTINE {
    // SAFETY: the caller placed executable code at `address`; the OS only calls it
    Some(unsafe {
        std::mem::transmute::<usize, unsafe extern "system" fn(*mut c_void) -> u32>(address)
    })
}

fn wait_slice(handle: &HandleGuard, slice: Duration) -> Result<WaitOutcome> {
    let millis = slice.as_millis().min(u32::MAX as u128 - 1) as u32;
    match unsafe { WaitForSingleObject(handle.raw(), millis) } {
        WAIT_OBJECT_0 => Ok(WaitOutcome::Completed),
        WAIT_TIMEOUT => Ok(WaitOutcome::Pending),
        _ => Err(LoaderError::last_os(LoaderError::Execution, "WaitForSingleObject")),
    }
}

/// Wait for a thread or process handle under `wait`
pub fn wait_handle(handle: &HandleGuard, wait: &WaitPolicy) -> Result<()> {
    wait.wait_until(|slice| {
        Ok(match wait_slice(handle, slice)? {
            WaitOutcome::Completed => Some(()),
            WaitOutcome::Pending => None,
        })
    })
}

/// Process-creation attribute list carrying a machine-type override.
///
/// The list and the machine value it points at live as long as this value.
struct AttributeList {
    buffer: Vec<usize>,
    _machine: Box<u16>,
}

impl AttributeList {
    fn machine_type(machine: u16) -> Result<Self> {
        let mut size = 0usize;
        // Sizing call, fails with ERROR_INSUFFICIENT_BUFFER by contract
        unsafe { InitializeProcThreadAttributeList(null_mut(), 1, 0, &mut size) };
        if size == 0 {
            return Err(LoaderError::last_os(
                LoaderError::ProcessCreation,
                "InitializeProcThreadAttributeList",
            ));
        }

        let words = size.div_ceil(std::mem::size_of::<usize>());
        let mut buffer = vec![0usize; words];
        let list = buffer.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST;
        if unsafe { InitializeProcThreadAttributeList(list, 1, 0, &mut size) } == 0 {
            return Err(LoaderError::last_os(
                LoaderError::ProcessCreation,
                "InitializeProcThreadAttributeList",
            ));
        }

        let attributes = Self {
            buffer,
            _machine: Box::new(machine),
        };

        let value: *const u16 = &*attributes._machine;
        let ok = unsafe {
            UpdateProcThreadAttribute(
                attributes.as_ptr(),
                0,
                PROC_THREAD_ATTRIBUTE_MACHINE_TYPE,
                value as *const c_void,
                std::mem::size_of::<u16>(),
                null_mut(),
                null(),
            )
        };
        if ok == 0 {
            return Err(LoaderError::last_os(
                LoaderError::ProcessCreation,
                "UpdateProcThreadAttribute",
            ));
        }

        Ok(attributes)
    }

    fn as_ptr(&self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.buffer.as_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        unsafe { DeleteProcThreadAttributeList(self.as_ptr()) };
    }
}

/// A suspended host process and its primary thread
pub struct Win32Process {
    process: HandleGuard,
    thread: HandleGuard,
    pid: u32,
}

/// Kernel32-backed [`ProcessApi`]
pub struct Win32Api;

impl ProcessApi for Win32Api {
    type Process = Win32Process;
    type Thread = HandleGuard;

    fn spawn_suspended(&self, host: &Path, machine: Option<u16>) -> Result<Win32Process> {
        let application: Vec<u16> = host.as_os_str().encode_wide().chain(Some(0)).collect();
        let attributes = machine.map(AttributeList::machine_type).transpose()?;

        let mut startup: STARTUPINFOEXW = unsafe { std::mem::zeroed() };
        let mut flags = CREATE_SUSPENDED;
        match &attributes {
            Some(list) => {
                startup.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;
                startup.lpAttributeList = list.as_ptr();
                flags |= EXTENDED_STARTUPINFO_PRESENT;
            }
            None => startup.StartupInfo.cb = std::mem::size_of::<STARTUPINFOW>() as u32,
        }

        let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
        let ok = unsafe {
            CreateProcessW(
                application.as_ptr(),
                null_mut(),
                null(),
                null(),
                1,
                flags,
                null(),
                null(),
                &startup.StartupInfo,
                &mut info,
            )
        };
        drop(attributes);

        if ok == 0 {
            return Err(LoaderError::last_os(LoaderError::ProcessCreation, "CreateProcessW"));
        }

        log::info!("Spawned suspended {} (pid {})", host.display(), info.dwProcessId);
        Ok(Win32Process {
            process: HandleGuard::new(info.hProcess),
            thread: HandleGuard::new(info.hThread),
            pid: info.dwProcessId,
        })
    }

    fn allocate(&self, process: &Win32Process, size: usize) -> Result<RemoteRegion> {
        let base = unsafe {
            VirtualAllocEx(
                process.process.raw(),
                null(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if base.is_null() {
            return Err(LoaderError::last_os(LoaderError::Allocation, "VirtualAllocEx"));
        }
        Ok(RemoteRegion {
            base: base as usize as u64,
            size,
        })
    }

    fn write(&self, process: &Win32Process, region: &RemoteRegion, bytes: &[u8]) -> Result<usize> {
        let mut written = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                process.process.raw(),
                region.base as usize as *const c_void,
                bytes.as_ptr().cast(),
                bytes.len(),
                &mut written,
            )
        };
        if ok == 0 {
            log::warn!(
                "WriteProcessMemory into pid {} failed: {}",
                process.pid,
                std::io::Error::last_os_error()
            );
        }
        Ok(written)
    }

    fn create_thread(&self, process: &Win32Process, start: u64) -> Result<HandleGuard> {
        let address = usize::try_from(start).map_err(|_| {
            LoaderError::Execution(format!(
                "start address 0x{:x} is not addressable from this process",
                start
            ))
        })?;

        let handle = unsafe {
            CreateRemoteThread(
                process.process.raw(),
                null(),
                0,
                start_routine(address),
                null(),
                0,
                null_mut(),
            )
        };
        if handle.is_null() {
            return Err(LoaderError::last_os(LoaderError::Execution, "CreateRemoteThread"));
        }
        Ok(HandleGuard::new(handle))
    }

    fn wait(&self, thread: &HandleGuard, slice: Duration) -> Result<WaitOutcome> {
        wait_slice(thread, slice)
    }

    fn exit_code(&self, thread: &HandleGuard) -> Result<u32> {
        let mut code = 0u32;
        if unsafe { GetExitCodeThread(thread.raw(), &mut code) } == 0 {
            return Err(LoaderError::last_os(LoaderError::Execution, "GetExitCodeThread"));
        }
        Ok(code)
    }

    fn close_thread(&self, thread: HandleGuard) -> Result<()> {
        thread.close()
    }

    fn terminate(&self, process: &Win32Process) -> Result<()> {
        if unsafe { TerminateProcess(process.process.raw(), 0) } == 0 {
            return Err(LoaderError::last_os(LoaderError::Execution, "TerminateProcess"));
        }
        Ok(())
    }

    fn close_process(&self, process: Win32Process) -> Result<()> {
        let Win32Process { process, thread, pid } = process;
        log::debug!("Closing handles of pid {}", pid);
        let thread_result = thread.close();
        process.close()?;
        thread_result
    }
}
