//! Error types for shellcode loading and execution

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Every way a load-and-execute run can fail.
///
/// None of these are retried: allocation failures, malformed images and missing
/// executables are not transient for the duration of a run.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The target cannot run on this host by any strategy
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),

    /// The requested architecture name is not in the catalog
    #[error("unknown architecture '{name}' (known: {known})")]
    UnknownArchitecture { name: String, known: String },

    /// No injection host executable exists for the target
    #[error("no host process available for {arch} (tried: {tried:?})")]
    HostProcessUnavailable { arch: String, tried: Vec<PathBuf> },

    /// None of the emulator candidates were found on the search path
    #[error("no emulator found (tried: {})", tried.join(", "))]
    EmulatorNotFound { tried: Vec<String> },

    /// Memory could not be reserved, committed or made executable
    #[error("memory allocation failed: {0}")]
    Allocation(String),

    /// The OS refused to create the host or emulator process
    #[error("process creation failed: {0}")]
    ProcessCreation(String),

    /// Fewer bytes than the image length reached the remote process
    #[error("partial write: {written} of {expected} bytes transferred")]
    PartialWrite { written: usize, expected: usize },

    /// A thread could not be started or its result could not be collected
    #[error("execution failed: {0}")]
    Execution(String),

    /// The container could not be parsed or has no usable entry point
    #[error("no entry point: {0}")]
    NoEntry(String),

    /// The input is not a usable shellcode image
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// The wait was interrupted by the user
    #[error("execution cancelled")]
    Cancelled,

    /// The payload did not finish within the configured timeout
    #[error("execution timed out after {0:?}")]
    TimedOut(Duration),

    /// The architecture catalog file is malformed
    #[error("invalid catalog: {0}")]
    Catalog(String),

    /// Filesystem error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(windows)]
impl LoaderError {
    /// Attach the last OS error to a failing API name
    pub(crate) fn last_os(kind: fn(String) -> LoaderError, api: &str) -> LoaderError {
        kind(format!("{}: {}", api, std::io::Error::last_os_error()))
    }
}
