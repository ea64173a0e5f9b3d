//! Shellhost: architecture-aware shellcode loader
//!
//! This crate runs position-independent code built for a named target architecture,
//! choosing between in-process execution, a kernel-loaded container, injection into a
//! suspended host process, or a user-mode emulator depending on what the host can run.

pub mod disasm;
pub mod engine;
pub mod error;
pub mod image;
pub mod platform;
pub mod strategy;

pub use disasm::preview::{EntryPreview, PreviewLine};
pub use engine::cancel::{CancelToken, WaitPolicy};
pub use engine::inject::{inject, InjectionExecutor, InjectionSession, ProcessApi, RemoteRegion, WaitOutcome};
pub use engine::runner::Plan;
pub use engine::{executor_for, ExecutionContext, Executor, ExitCode};
pub use error::{LoaderError, Result};
pub use image::loader::{load_image, load_image_from_bytes, resolve, InputFormat, ShellcodeImage, SourceFormat};
pub use platform::catalog::{ArchitectureDescriptor, Bitness, Catalog, CpuFamily};
pub use platform::host::{HostProfile, OperatingSystem};
pub use strategy::config::LoaderConfig;
pub use strategy::selector::{select, ExecutionStrategy, Target};
