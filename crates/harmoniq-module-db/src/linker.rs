//! Seam over the platform dynamic-linking facility.

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};

use libloading::Library;

use crate::error::LinkError;

/// Opens loadable units by path.
///
/// The database never calls the OS loader directly; tests substitute a double
/// that counts opens and closes.
pub trait DynamicLinker: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedUnit>, LinkError>;
}

/// A unit opened by a [`DynamicLinker`]. Dropping it closes the unit.
pub trait LoadedUnit: Send + Sync {
    /// Resolves an exported symbol to its address.
    fn symbol(&self, name: &str) -> Result<*const c_void, LinkError>;

    /// Path the unit was opened from.
    fn path(&self) -> &Path;
}

/// [`DynamicLinker`] backed by `libloading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibLoadingLinker;

impl DynamicLinker for LibLoadingLinker {
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedUnit>, LinkError> {
        LibraryUnit::open(path).map(|unit| Box::new(unit) as Box<dyn LoadedUnit>)
    }
}

/// A shared object kept open for as long as this value lives.
pub struct LibraryUnit {
    library_path: PathBuf,
    library: Library,
}

impl LibraryUnit {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LinkError::MissingUnit(path.to_path_buf()));
        }

        // Safety: running a unit's initializers is inherent to loading module code.
        let library = unsafe { Library::new(path) }?;
        Ok(Self {
            library_path: path.to_path_buf(),
            library,
        })
    }
}

impl LoadedUnit for LibraryUnit {
    fn symbol(&self, name: &str) -> Result<*const c_void, LinkError> {
        let address = unsafe {
            self.library
                .get::<*const c_void>(name.as_bytes())
                .map(|symbol| *symbol)
                .map_err(|_| LinkError::missing_symbol(&self.library_path, name))?
        };
        if address.is_null() {
            return Err(LinkError::missing_symbol(&self.library_path, name));
        }
        Ok(address)
    }

    fn path(&self) -> &Path {
        &self.library_path
    }
}

impl fmt::Debug for LibraryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryUnit")
            .field("library_path", &self.library_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_unit_is_reported_before_dlopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.so");
        match LibLoadingLinker.open(&path) {
            Err(LinkError::MissingUnit(reported)) => assert_eq!(reported, path),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opening a missing unit must fail"),
        }
    }

    #[test]
    fn garbage_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.so");
        std::fs::write(&path, b"not a shared object").unwrap();
        assert!(matches!(
            LibLoadingLinker.open(&path),
            Err(LinkError::Library(_))
        ));
    }
}
