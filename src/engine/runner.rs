//! Top-level load-select-execute sequence
//!
//! Selection happens before the image is read, so a target that cannot run here is
//! rejected before any file, memory or process is touched.

use std::path::Path;

use super::cancel::{CancelToken, WaitPolicy};
use super::{executor_for, ExecutionContext, Executor, ExitCode};
use crate::error::{LoaderError, Result};
use crate::image::loader::ShellcodeImage;
use crate::platform::catalog::Bitness;
use crate::platform::host::{running_bits, HostProfile, OperatingSystem};
use crate::strategy::config::LoaderConfig;
use crate::strategy::selector::{select, ExecutionStrategy, Target};

/// The decision made for one run, before anything executes
#[derive(Clone, Copy, Debug)]
pub struct Plan<'a> {
    pub host: HostProfile,
    pub running_bits: Bitness,
    pub target: Target<'a>,
    pub strategy: ExecutionStrategy,
}

impl<'a> Plan<'a> {
    /// Plan a run of `arch` on the machine this process runs on. The target OS defaults
    /// to the host's.
    pub fn detect(
        config: &'a LoaderConfig,
        arch: &str,
        os: Option<OperatingSystem>,
    ) -> Result<Self> {
        Self::for_host(config, HostProfile::detect(), running_bits(), arch, os)
    }

    /// Plan against an explicit host profile
    pub fn for_host(
        config: &'a LoaderConfig,
        host: HostProfile,
        running_bits: Bitness,
        arch: &str,
        os: Option<OperatingSystem>,
    ) -> Result<Self> {
        let descriptor = config.catalog.lookup(arch)?;
        let target = Target::new(descriptor, os.unwrap_or(host.os));
        let strategy = select(&host, &target, running_bits)?;

        log::info!(
            "Host {} {} {}, target {} {} ({}): {}",
            host.os,
            host.family,
            host.bits,
            target.os,
            descriptor.name,
            descriptor.bits,
            strategy
        );

        Ok(Self {
            host,
            running_bits,
            target,
            strategy,
        })
    }

    /// Run `image` with `executor`, which must implement this plan's strategy
    pub fn execute_with(
        &self,
        executor: &dyn Executor,
        image: ShellcodeImage,
        config: &LoaderConfig,
        source: Option<&Path>,
        token: CancelToken,
    ) -> Result<ExitCode> {
        if executor.strategy() != self.strategy {
            return Err(LoaderError::Execution(format!(
                "executor for {} cannot run a {} plan",
                executor.strategy(),
                self.strategy
            )));
        }

        let ctx = ExecutionContext {
            target: self.target,
            config,
            wait: WaitPolicy::new(token, config.timeout),
            source,
        };
        executor.execute(image, &ctx)
    }

    /// Run `image` with this platform's executor for the planned strategy
    pub fn execute(
        &self,
        image: ShellcodeImage,
        config: &LoaderConfig,
        source: Option<&Path>,
        token: CancelToken,
    ) -> Result<ExitCode> {
        let executor = executor_for(self.strategy)?;
        self.execute_with(executor.as_ref(), image, config, source, token)
    }
}
