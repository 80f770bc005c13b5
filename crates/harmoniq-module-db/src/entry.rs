//! Entry-point ABI shared by static and dynamically loaded processing modules.

use std::ffi::c_void;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix appended to a module tag to name its static-properties export.
pub const STATIC_PROPERTIES_SUFFIX: &str = "_get_static_properties";
/// Suffix appended to a module tag to name its initializer export.
pub const INIT_SUFFIX: &str = "_init";

/// Capability metadata a module reports before it is instantiated.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticProperties {
    pub instance_size: u32,
    pub stack_size: u32,
    pub version_major: u32,
    pub version_minor: u32,
}

/// Fills `props` with the module's static capability metadata. Returns zero on success.
pub type GetStaticPropertiesFn = unsafe extern "C" fn(props: *mut StaticProperties) -> i32;
/// Initializes a module instance in caller-provided memory. Returns zero on success.
pub type InitFn = unsafe extern "C" fn(instance: *mut c_void) -> i32;

/// The two functions every processing module exposes.
#[derive(Clone, Copy)]
pub struct EntryPoints {
    pub get_static_properties: GetStaticPropertiesFn,
    pub init: InitFn,
}

impl EntryPoints {
    pub const fn new(get_static_properties: GetStaticPropertiesFn, init: InitFn) -> Self {
        Self {
            get_static_properties,
            init,
        }
    }

    /// Builds entry points from two resolved symbol addresses.
    ///
    /// # Safety
    ///
    /// Both addresses must point at functions with the [`GetStaticPropertiesFn`]
    /// and [`InitFn`] signatures, and must stay valid for as long as the
    /// returned value is used.
    pub unsafe fn from_raw(get_static_properties: *const c_void, init: *const c_void) -> Self {
        Self {
            get_static_properties: std::mem::transmute::<*const c_void, GetStaticPropertiesFn>(
                get_static_properties,
            ),
            init: std::mem::transmute::<*const c_void, InitFn>(init),
        }
    }

    /// Calls the static-properties entry point.
    ///
    /// # Safety
    ///
    /// The code behind the entry points must still be mapped. For entry points
    /// taken from a [`ModuleHandle`](crate::ModuleHandle) the handle has to
    /// outlive the call; [`ModuleHandle::static_properties`](crate::ModuleHandle::static_properties)
    /// upholds this.
    ///
    /// Calling it from safe code does not compile:
    ///
    /// ```compile_fail
    /// use harmoniq_module_db::EntryPoints;
    ///
    /// fn query(entry_points: &EntryPoints) {
    ///     let _ = entry_points.static_properties();
    /// }
    /// ```
    pub unsafe fn static_properties(&self) -> Result<StaticProperties, i32> {
        let mut props = StaticProperties::default();
        let status = (self.get_static_properties)(&mut props);
        if status == 0 {
            Ok(props)
        } else {
            Err(status)
        }
    }
}

impl fmt::Debug for EntryPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPoints")
            .field(
                "get_static_properties",
                &(self.get_static_properties as *const c_void),
            )
            .field("init", &(self.init as *const c_void))
            .finish()
    }
}

/// Symbol names a loadable unit must export for `tag`.
pub fn symbol_names(tag: &str) -> (String, String) {
    (
        format!("{tag}{STATIC_PROPERTIES_SUFFIX}"),
        format!("{tag}{INIT_SUFFIX}"),
    )
}

/// Which interface a registered module speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceType {
    /// Placeholder with no code behind it.
    Stub,
    /// A processing module exposing [`EntryPoints`].
    Module,
}

/// Small integer describing the role of a module (encoder, decoder, generic...).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleType(pub u32);

impl ModuleType {
    pub const GENERIC: ModuleType = ModuleType(2);
    pub const DECODER: ModuleType = ModuleType(3);
    pub const ENCODER: ModuleType = ModuleType(4);
    pub const CONVERTER: ModuleType = ModuleType(5);
    pub const PACKETIZER: ModuleType = ModuleType(6);
    pub const DEPACKETIZER: ModuleType = ModuleType(7);
    pub const DETECTOR: ModuleType = ModuleType(8);
    pub const GENERATOR: ModuleType = ModuleType(9);
    pub const FRAMEWORK: ModuleType = ModuleType(10);
}

/// Version reported through a module's static properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub major: u32,
    pub minor: u32,
}
