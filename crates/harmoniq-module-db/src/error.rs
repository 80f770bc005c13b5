use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by the module database.
///
/// Per-item results inside a handle batch carry this type, so it is cheap to
/// clone and comparable in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleDbError {
    #[error("module 0x{0:X} is already registered")]
    AlreadyRegistered(u32),
    #[error("module 0x{0:X} is not registered")]
    NotFound(u32),
    #[error("invalid parameter: {0}")]
    BadParam(String),
    #[error("out of memory")]
    OutOfMemory,
    #[error("failed to load module 0x{module_id:X}: {reason}")]
    LoadFailure { module_id: u32, reason: String },
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ModuleDbError {
    pub(crate) fn load_failure(module_id: u32, reason: impl ToString) -> Self {
        ModuleDbError::LoadFailure {
            module_id,
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by a [`DynamicLinker`](crate::DynamicLinker) implementation.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("loadable unit not found at {0}")]
    MissingUnit(PathBuf),
    #[error("failed to open loadable unit: {0}")]
    Open(String),
    #[error("symbol {symbol} not exported by {path}")]
    MissingSymbol { path: PathBuf, symbol: String },
    #[error("dynamic linker error: {0}")]
    Library(#[from] libloading::Error),
}

impl LinkError {
    pub(crate) fn missing_symbol(path: impl Into<PathBuf>, symbol: impl Into<String>) -> Self {
        LinkError::MissingSymbol {
            path: path.into(),
            symbol: symbol.into(),
        }
    }
}

/// Errors raised while reading a [`ModuleDbConfig`](crate::ModuleDbConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read module database config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse module database config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid module database config: {0}")]
    Invalid(String),
}
