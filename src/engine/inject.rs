//! Cross-process injection into a freshly spawned, suspended host process
//!
//! The protocol runs against [`ProcessApi`], which the Win32 backend implements on
//! Windows and tests implement with a recording double:
//!
//! 1. spawn the host suspended (optionally with a machine-type override)
//! 2. allocate an RWX region of image size inside it
//! 3. write the image, requiring every byte to land
//! 4. start a remote thread at `base + entry_offset`
//! 5. wait for it in slices, honouring cancellation and timeouts
//! 6. collect its exit status
//!
//! Teardown is owned by [`InjectionSession`] and the remote thread guard: whichever
//! step fails, the thread handle is closed, the process is terminated and its handles
//! are closed. Teardown failures are logged and never replace the error that caused
//! the unwind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::cancel::WaitPolicy;
use super::{ExecutionContext, Executor, ExitCode};
use crate::error::{LoaderError, Result};
use crate::image::loader::ShellcodeImage;
use crate::platform::catalog::ArchitectureDescriptor;
use crate::strategy::selector::ExecutionStrategy;

/// Memory committed inside the remote process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteRegion {
    pub base: u64,
    pub size: usize,
}

impl RemoteRegion {
    /// Absolute address of `offset` inside the region
    pub fn address(&self, offset: usize) -> Result<u64> {
        if offset >= self.size {
            return Err(LoaderError::NoEntry(format!(
                "entry offset 0x{:x} outside remote region of {} bytes",
                offset, self.size
            )));
        }
        self.base
            .checked_add(offset as u64)
            .ok_or_else(|| LoaderError::Execution("remote entry address overflows".to_string()))
    }
}

/// Result of one bounded wait on a remote thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    Pending,
}

/// Operating-system operations the injection protocol needs
pub trait ProcessApi {
    /// Owned handle(s) of a spawned process
    type Process;
    /// Owned handle of a remote thread
    type Thread;

    /// Create `host` suspended, optionally forcing its machine type
    fn spawn_suspended(&self, host: &Path, machine: Option<u16>) -> Result<Self::Process>;

    /// Commit an executable read-write region of `size` bytes
    fn allocate(&self, process: &Self::Process, size: usize) -> Result<RemoteRegion>;

    /// Copy `bytes` to the start of `region`, returning how many bytes were written
    fn write(&self, process: &Self::Process, region: &RemoteRegion, bytes: &[u8]) -> Result<usize>;

    /// Start a thread at the absolute address `start`
    fn create_thread(&self, process: &Self::Process, start: u64) -> Result<Self::Thread>;

    /// Block for at most `slice` waiting for `thread` to finish
    fn wait(&self, thread: &Self::Thread, slice: Duration) -> Result<WaitOutcome>;

    fn exit_code(&self, thread: &Self::Thread) -> Result<u32>;

    fn close_thread(&self, thread: Self::Thread) -> Result<()>;

    fn terminate(&self, process: &Self::Process) -> Result<()>;

    fn close_process(&self, process: Self::Process) -> Result<()>;
}

impl<T: ProcessApi + ?Sized> ProcessApi for &T {
    type Process = T::Process;
    type Thread = T::Thread;

    fn spawn_suspended(&self, host: &Path, machine: Option<u16>) -> Result<Self::Process> {
        (**self).spawn_suspended(host, machine)
    }

    fn allocate(&self, process: &Self::Process, size: usize) -> Result<RemoteRegion> {
        (**self).allocate(process, size)
    }

    fn write(&self, process: &Self::Process, region: &RemoteRegion, bytes: &[u8]) -> Result<usize> {
        (**self).write(process, region, bytes)
    }

    fn create_thread(&self, process: &Self::Process, start: u64) -> Result<Self::Thread> {
        (**self).create_thread(process, start)
    }

    fn wait(&self, thread: &Self::Thread, slice: Duration) -> Result<WaitOutcome> {
        (**self).wait(thread, slice)
    }

    fn exit_code(&self, thread: &Self::Thread) -> Result<u32> {
        (**self).exit_code(thread)
    }

    fn close_thread(&self, thread: Self::Thread) -> Result<()> {
        (**self).close_thread(thread)
    }

    fn terminate(&self, process: &Self::Process) -> Result<()> {
        (**self).terminate(process)
    }

    fn close_process(&self, process: Self::Process) -> Result<()> {
        (**self).close_process(process)
    }
}

/// A spawned host process, terminated and closed when dropped
pub struct InjectionSession<'a, A: ProcessApi> {
    api: &'a A,
    host: PathBuf,
    process: Option<A::Process>,
    region: Option<RemoteRegion>,
}

impl<'a, A: ProcessApi> InjectionSession<'a, A> {
    pub fn spawn(api: &'a A, host: &Path, machine: Option<u16>) -> Result<Self> {
        let process = api.spawn_suspended(host, machine)?;
        log::debug!(
            "Spawned suspended host {} (machine override: {:?})",
            host.display(),
            machine.map(|m| format!("0x{:04x}", m))
        );
        Ok(Self {
            api,
            host: host.to_path_buf(),
            process: Some(process),
            region: None,
        })
    }

    fn process(&self) -> Result<&A::Process> {
        self.process
            .as_ref()
            .ok_or_else(|| LoaderError::Execution("host process already released".to_string()))
    }

    pub fn region(&self) -> Option<RemoteRegion> {
        self.region
    }

    pub fn allocate(&mut self, size: usize) -> Result<RemoteRegion> {
        let region = self.api.allocate(self.process()?, size)?;
        log::debug!("Remote region 0x{:x} ({} bytes)", region.base, region.size);
        self.region = Some(region);
        Ok(region)
    }

    /// Write `bytes` into the allocated region; anything short of all of them fails
    pub fn transfer(&self, bytes: &[u8]) -> Result<()> {
        let region = self
            .region
            .ok_or_else(|| LoaderError::Allocation("no remote region allocated".to_string()))?;
        let written = self.api.write(self.process()?, &region, bytes)?;
        if written != bytes.len() {
            return Err(LoaderError::PartialWrite {
                written,
                expected: bytes.len(),
            });
        }
        Ok(())
    }

    pub fn launch(&self, start: u64) -> Result<RemoteThread<'a, A>> {
        let thread = self.api.create_thread(self.process()?, start)?;
        log::debug!("Remote thread started at 0x{:x}", start);
        Ok(RemoteThread {
            api: self.api,
            thread: Some(thread),
        })
    }
}

impl<A: ProcessApi> Drop for InjectionSession<'_, A> {
    fn drop(&mut self) {
        let Some(process) = self.process.take() else {
            return;
        };
        if let Err(e) = self.api.terminate(&process) {
            log::warn!("Failed to terminate host {}: {}", self.host.display(), e);
        }
        if let Err(e) = self.api.close_process(process) {
            log::warn!("Failed to close host {} handles: {}", self.host.display(), e);
        }
        log::debug!("Host {} torn down", self.host.display());
    }
}

/// Remote thread handle, closed when dropped
pub struct RemoteThread<'a, A: ProcessApi> {
    api: &'a A,
    thread: Option<A::Thread>,
}

impl<A: ProcessApi> RemoteThread<'_, A> {
    fn thread(&self) -> Result<&A::Thread> {
        self.thread
            .as_ref()
            .ok_or_else(|| LoaderError::Execution("remote thread already closed".to_string()))
    }

    pub fn join(&self, wait: &WaitPolicy) -> Result<()> {
        let thread = self.thread()?;
        wait.wait_until(|slice| {
            Ok(match self.api.wait(thread, slice)? {
                WaitOutcome::Completed => Some(()),
                WaitOutcome::Pending => None,
            })
        })
    }

    pub fn exit_code(&self) -> Result<u32> {
        self.api.exit_code(self.thread()?)
    }
}

impl<A: ProcessApi> Drop for RemoteThread<'_, A> {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if let Err(e) = self.api.close_thread(thread) {
                log::warn!("Failed to close remote thread handle: {}", e);
            }
        }
    }
}

/// First injection host of `arch` that exists on disk
pub fn find_host_process(arch: &ArchitectureDescriptor) -> Result<PathBuf> {
    arch.injection_hosts
        .iter()
        .find(|path| path.is_file())
        .cloned()
        .ok_or_else(|| LoaderError::HostProcessUnavailable {
            arch: arch.name.clone(),
            tried: arch.injection_hosts.clone(),
        })
}

/// Run `image` inside a new suspended instance of `host` and return the remote
/// thread's exit status.
pub fn inject<A: ProcessApi>(
    api: &A,
    host: &Path,
    machine: Option<u16>,
    image: &ShellcodeImage,
    wait: &WaitPolicy,
) -> Result<ExitCode> {
    let mut session = InjectionSession::spawn(api, host, machine)?;
    let region = session.allocate(image.len())?;
    session.transfer(image.bytes())?;

    let start = region.address(image.entry_offset())?;
    // Declared after the session so its handle closes before the process is torn down
    let thread = session.launch(start)?;
    thread.join(wait)?;
    let code = thread.exit_code()?;

    log::info!("Remote thread in {} exited with {}", host.display(), code);
    Ok(ExitCode(code))
}

/// Executor for [`ExecutionStrategy::RemoteInject`] and
/// [`ExecutionStrategy::RemoteInjectCrossFamily`]
pub struct InjectionExecutor<A> {
    api: A,
    cross_family: bool,
}

impl<A: ProcessApi> InjectionExecutor<A> {
    pub fn new(api: A, cross_family: bool) -> Self {
        Self { api, cross_family }
    }
}

impl<A: ProcessApi> Executor for InjectionExecutor<A> {
    fn strategy(&self) -> ExecutionStrategy {
        if self.cross_family {
            ExecutionStrategy::RemoteInjectCrossFamily
        } else {
            ExecutionStrategy::RemoteInject
        }
    }

    fn execute(&self, image: ShellcodeImage, ctx: &ExecutionContext<'_>) -> Result<ExitCode> {
        let arch = ctx.target.arch;
        let host = find_host_process(arch)?;
        let machine = self.cross_family.then_some(arch.pe_machine);

        log::info!(
            "Injecting {} bytes into {} ({})",
            image.len(),
            host.display(),
            self.strategy()
        );
        inject(&self.api, &host, machine, &image, &ctx.wait)
    }
}
