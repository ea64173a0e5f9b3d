//! Loader configuration shared by selection and execution

use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::image::loader::InputFormat;
use crate::platform::catalog::Catalog;

/// Immutable settings for one run, built at startup and passed by reference
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    /// Known target architectures
    pub catalog: Catalog,
    /// How to interpret the input file
    pub input_format: InputFormat,
    /// Fail instead of defaulting to offset 0 when a PE has no `.text` section
    pub strict_entry: bool,
    /// Upper bound on the wait for the payload; `None` waits forever
    pub timeout: Option<Duration>,
    /// Directories searched for emulators; `None` uses `PATH`
    pub search_path: Option<OsString>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            catalog: Catalog::builtin(),
            input_format: InputFormat::Auto,
            strict_entry: false,
            timeout: None,
            search_path: None,
        }
    }
}

impl LoaderConfig {
    /// Replace the built-in catalog with one loaded from a JSON file
    pub fn with_catalog_file(mut self, path: &Path) -> Result<Self> {
        self.catalog = Catalog::load(path)?;
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_input_format(mut self, format: InputFormat) -> Self {
        self.input_format = format;
        self
    }

    pub fn with_strict_entry(mut self, strict: bool) -> Self {
        self.strict_entry = strict;
        self
    }

    pub fn with_search_path(mut self, path: Option<OsString>) -> Self {
        self.search_path = path;
        self
    }

    /// The emulator search path in effect
    pub fn effective_search_path(&self) -> OsString {
        self.search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_default()
    }
}
