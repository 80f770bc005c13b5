#![allow(dead_code)]

use std::collections::HashSet;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use harmoniq_module_db::{
    DynamicLinker, EntryPoints, LinkError, LoadedUnit, ModuleDatabase, ModuleDbConfig,
    ModuleRegistration, ModuleSource, ModuleType, StaticProperties, INIT_SUFFIX,
    STATIC_PROPERTIES_SUFFIX,
};

pub const M1: u32 = 0x0700_1000;
pub const M2: u32 = 0x0700_2000;
pub const FOO_PATH: &str = "/lib/foo.so";

unsafe extern "C" fn unit_props(props: *mut StaticProperties) -> i32 {
    (*props).instance_size = 256;
    (*props).version_major = 1;
    (*props).version_minor = 2;
    0
}

unsafe extern "C" fn unit_init(_instance: *mut c_void) -> i32 {
    0
}

unsafe extern "C" fn linked_props(props: *mut StaticProperties) -> i32 {
    (*props).version_major = 9;
    (*props).version_minor = 0;
    0
}

unsafe extern "C" fn linked_init(_instance: *mut c_void) -> i32 {
    0
}

/// Entry points of a module linked into the test binary.
pub fn linked_entry_points() -> EntryPoints {
    EntryPoints::new(linked_props, linked_init)
}

#[derive(Default)]
struct FakeState {
    opens: AtomicUsize,
    closes: AtomicUsize,
    failing_paths: Mutex<HashSet<PathBuf>>,
    missing_symbols: Mutex<HashSet<String>>,
    open_delay: Mutex<Option<Duration>>,
}

/// Dynamic linker double. Every path opens unless told otherwise, and every
/// unit exports the module entry points under any tag.
#[derive(Clone, Default)]
pub struct FakeLinker {
    state: Arc<FakeState>,
}

impl FakeLinker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, path: impl Into<PathBuf>) {
        self.state.failing_paths.lock().unwrap().insert(path.into());
    }

    pub fn hide_symbol(&self, name: impl Into<String>) {
        self.state.missing_symbols.lock().unwrap().insert(name.into());
    }

    pub fn delay_opens(&self, delay: Duration) {
        *self.state.open_delay.lock().unwrap() = Some(delay);
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn shared(&self) -> Arc<dyn DynamicLinker> {
        Arc::new(self.clone())
    }
}

impl DynamicLinker for FakeLinker {
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedUnit>, LinkError> {
        let delay = *self.state.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if self.state.failing_paths.lock().unwrap().contains(path) {
            return Err(LinkError::Open(format!("{}: no such unit", path.display())));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeUnit {
            path: path.to_path_buf(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeUnit {
    path: PathBuf,
    state: Arc<FakeState>,
}

impl LoadedUnit for FakeUnit {
    fn symbol(&self, name: &str) -> Result<*const c_void, LinkError> {
        let missing = || LinkError::MissingSymbol {
            path: self.path.clone(),
            symbol: name.to_owned(),
        };
        if self.state.missing_symbols.lock().unwrap().contains(name) {
            return Err(missing());
        }
        if name.ends_with(STATIC_PROPERTIES_SUFFIX) {
            Ok(unit_props as *const c_void)
        } else if name.ends_with(INIT_SUFFIX) {
            Ok(unit_init as *const c_void)
        } else {
            Err(missing())
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FakeUnit {
    fn drop(&mut self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn database(linker: &FakeLinker) -> ModuleDatabase {
    ModuleDatabase::builder(ModuleDbConfig::default())
        .linker(linker.shared())
        .build()
        .unwrap()
}

pub fn register_dynamic(db: &ModuleDatabase, module_id: u32, path: &str, tag: &str) {
    db.register(ModuleRegistration::new(
        ModuleType::GENERIC,
        module_id,
        ModuleSource::dynamic(path, tag),
    ))
    .unwrap();
}

pub fn dl_refs(db: &ModuleDatabase, module_id: u32) -> u32 {
    db.module_info(module_id).unwrap().dl_refs.unwrap()
}

pub fn mem_refs(db: &ModuleDatabase, module_id: u32) -> usize {
    db.module_info(module_id).unwrap().mem_refs
}
