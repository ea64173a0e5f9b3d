//! Kernel-loaded execution: the payload wrapped in an ELF of the target's bit width
//! and run as a child process, leaving the bit-width transition to the OS loader

use super::child::ChildGuard;
use super::{ExecutionContext, Executor, ExitCode};
use crate::error::Result;
use crate::image::container::prepare_executable;
use crate::image::loader::ShellcodeImage;
use crate::strategy::selector::ExecutionStrategy;

/// Executor for [`ExecutionStrategy::LocalRelocate`]
pub struct RelocateExecutor;

impl Executor for RelocateExecutor {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::LocalRelocate
    }

    fn execute(&self, image: ShellcodeImage, ctx: &ExecutionContext<'_>) -> Result<ExitCode> {
        let container = prepare_executable(&image, ctx.target.arch, ctx.source)?;
        log::info!(
            "Running {} container {}",
            ctx.target.arch.name,
            container.path().display()
        );

        let no_args: [&str; 0] = [];
        let child = ChildGuard::spawn(container.path(), &no_args)?;

        // `container` outlives the child: the guard is consumed before the file drops
        child.wait(&ctx.wait)
    }
}
