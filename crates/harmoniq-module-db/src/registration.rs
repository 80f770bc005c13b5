use std::borrow::Cow;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::entry::{EntryPoints, ModuleType};
use crate::error::ModuleDbError;

/// Where the code of a registered module comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// A placeholder id with no code.
    Stub,
    /// Entry points already linked into the running image.
    Static(EntryPoints),
    /// A loadable unit opened on first use.
    ///
    /// Built-in tables hand in borrowed `'static` strings; custom registrations
    /// own their copies.
    Dynamic {
        source_path: Cow<'static, Path>,
        tag: Cow<'static, str>,
    },
}

impl ModuleSource {
    pub fn dynamic(source_path: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        ModuleSource::Dynamic {
            source_path: Cow::Owned(source_path.into()),
            tag: Cow::Owned(tag.into()),
        }
    }

    /// Dynamic source borrowing strings that live for the whole process.
    pub fn dynamic_static(source_path: &'static str, tag: &'static str) -> Self {
        ModuleSource::Dynamic {
            source_path: Cow::Borrowed(Path::new(source_path)),
            tag: Cow::Borrowed(tag),
        }
    }
}

/// A request to add one module to the database.
#[derive(Debug, Clone)]
pub struct ModuleRegistration {
    pub module_type: ModuleType,
    pub module_id: u32,
    pub source: ModuleSource,
    /// Built-in modules cannot be deregistered by a caller.
    pub is_built_in: bool,
}

impl ModuleRegistration {
    pub fn new(module_type: ModuleType, module_id: u32, source: ModuleSource) -> Self {
        Self {
            module_type,
            module_id,
            source,
            is_built_in: false,
        }
    }

    pub fn built_in(mut self) -> Self {
        self.is_built_in = true;
        self
    }

    /// Builds a registration from the loose form used by collaborator tables.
    ///
    /// Static entry points and a `(source_path, tag)` pair are mutually
    /// exclusive; a record with neither describes a stub. A record with only one
    /// of path or tag is kept as dynamic and rejected when it is registered.
    pub fn from_parts(
        module_type: ModuleType,
        module_id: u32,
        entry_points: Option<EntryPoints>,
        source_path: Option<PathBuf>,
        tag: Option<String>,
        is_built_in: bool,
    ) -> Result<Self, ModuleDbError> {
        let source = match (entry_points, source_path, tag) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(ModuleDbError::BadParam(format!(
                    "module 0x{module_id:X} has both static entry points and a loadable unit"
                )))
            }
            (Some(entry_points), None, None) => ModuleSource::Static(entry_points),
            (None, None, None) => ModuleSource::Stub,
            (None, path, tag) => ModuleSource::dynamic(path.unwrap_or_default(), tag.unwrap_or_default()),
        };
        Ok(Self {
            module_type,
            module_id,
            source,
            is_built_in,
        })
    }
}

/// Serializable description of a dynamic or stub module.
///
/// This is the form configuration files and batch registration commands use;
/// static entry points can only be supplied from code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub module_type: ModuleType,
    pub module_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl ModuleRecord {
    pub fn dynamic(
        module_type: ModuleType,
        module_id: u32,
        source_path: impl Into<PathBuf>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            module_type,
            module_id,
            source_path: Some(source_path.into()),
            tag: Some(tag.into()),
        }
    }

    pub fn stub(module_type: ModuleType, module_id: u32) -> Self {
        Self {
            module_type,
            module_id,
            source_path: None,
            tag: None,
        }
    }

    pub fn to_registration(&self, is_built_in: bool) -> Result<ModuleRegistration, ModuleDbError> {
        ModuleRegistration::from_parts(
            self.module_type,
            self.module_id,
            None,
            self.source_path.clone(),
            self.tag.clone(),
            is_built_in,
        )
    }
}
