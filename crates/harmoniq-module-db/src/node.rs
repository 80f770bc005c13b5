//! Registered module records and the references that keep them alive.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::entry::{EntryPoints, InterfaceType, ModuleType, StaticProperties};
use crate::error::ModuleDbError;
use crate::linker::LoadedUnit;
use crate::metrics::Counters;
use crate::registration::{ModuleRegistration, ModuleSource};

/// Load state of a dynamic node. Only touched with the node's load lock held.
#[derive(Default)]
pub(crate) struct DynamicState {
    pub(crate) dl_refs: u32,
    pub(crate) unit: Option<Box<dyn LoadedUnit>>,
    pub(crate) entry_points: Option<EntryPoints>,
    pub(crate) from_fallback: bool,
}

impl DynamicState {
    pub(crate) fn is_loaded(&self) -> bool {
        self.dl_refs > 0
    }
}

pub(crate) struct DynamicExtension {
    tag: Cow<'static, str>,
    source_path: Cow<'static, Path>,
    state: Mutex<DynamicState>,
}

impl DynamicExtension {
    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Takes the node's load lock. Loads of different nodes never contend here.
    pub(crate) fn lock(&self) -> MutexGuard<'_, DynamicState> {
        self.state.lock()
    }
}

pub(crate) enum NodeKind {
    Stub,
    Static(EntryPoints),
    Dynamic(DynamicExtension),
}

/// Outcome of trying to take a reference on already-resolved code.
pub(crate) enum Acquisition {
    /// Resolved without a load. `dynamic` is set when a `dl_refs` reference was taken.
    Ready {
        entry_points: Option<EntryPoints>,
        dynamic: bool,
        from_fallback: bool,
    },
    NeedsLoad,
}

/// One registered module.
///
/// `mem_refs` counts every live holder, the registry's own entry included.
/// Dynamic nodes additionally track how many holders need the unit loaded.
pub struct ModuleNode {
    module_id: u32,
    module_type: ModuleType,
    is_built_in: bool,
    mem_refs: AtomicUsize,
    kind: NodeKind,
    counters: Arc<Counters>,
}

impl ModuleNode {
    pub(crate) fn new(
        registration: ModuleRegistration,
        counters: Arc<Counters>,
    ) -> Result<Self, ModuleDbError> {
        let module_id = registration.module_id;
        let kind = match registration.source {
            ModuleSource::Stub => NodeKind::Stub,
            ModuleSource::Static(entry_points) => NodeKind::Static(entry_points),
            ModuleSource::Dynamic { source_path, tag } => {
                if tag.is_empty() {
                    return Err(ModuleDbError::BadParam(format!(
                        "dynamic module 0x{module_id:X} has no tag"
                    )));
                }
                if source_path.as_os_str().is_empty() {
                    return Err(ModuleDbError::BadParam(format!(
                        "dynamic module 0x{module_id:X} has no source path"
                    )));
                }
                NodeKind::Dynamic(DynamicExtension {
                    tag,
                    source_path,
                    state: Mutex::new(DynamicState::default()),
                })
            }
        };

        counters.node_created();
        Ok(Self {
            module_id,
            module_type: registration.module_type,
            is_built_in: registration.is_built_in,
            mem_refs: AtomicUsize::new(1),
            kind,
            counters,
        })
    }

    pub fn module_id(&self) -> u32 {
        self.module_id
    }

    pub fn module_type(&self) -> ModuleType {
        self.module_type
    }

    pub fn is_built_in(&self) -> bool {
        self.is_built_in
    }

    pub fn is_static(&self) -> bool {
        !matches!(self.kind, NodeKind::Dynamic(_))
    }

    pub fn interface_type(&self) -> InterfaceType {
        match self.kind {
            NodeKind::Stub => InterfaceType::Stub,
            NodeKind::Static(_) | NodeKind::Dynamic(_) => InterfaceType::Module,
        }
    }

    pub fn mem_refs(&self) -> usize {
        self.mem_refs.load(Ordering::Acquire)
    }

    /// Current load count, `None` for static and stub nodes.
    pub fn dl_refs(&self) -> Option<u32> {
        self.dynamic().map(|ext| ext.lock().dl_refs)
    }

    pub(crate) fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub(crate) fn dynamic(&self) -> Option<&DynamicExtension> {
        match &self.kind {
            NodeKind::Dynamic(ext) => Some(ext),
            _ => None,
        }
    }

    pub(crate) fn add_holder(&self) {
        self.mem_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Resolves the node without a load if it can.
    ///
    /// Static and stub nodes always resolve. A dynamic node resolves only while
    /// another holder keeps its unit loaded, in which case `dl_refs` grows by one.
    pub(crate) fn acquire_if_loaded(&self) -> Acquisition {
        match &self.kind {
            NodeKind::Stub => Acquisition::Ready {
                entry_points: None,
                dynamic: false,
                from_fallback: false,
            },
            NodeKind::Static(entry_points) => Acquisition::Ready {
                entry_points: Some(*entry_points),
                dynamic: false,
                from_fallback: false,
            },
            NodeKind::Dynamic(ext) => {
                let mut state = ext.lock();
                if !state.is_loaded() {
                    return Acquisition::NeedsLoad;
                }
                state.dl_refs += 1;
                Acquisition::Ready {
                    entry_points: state.entry_points,
                    dynamic: true,
                    from_fallback: state.from_fallback,
                }
            }
        }
    }

    /// Gives back one `dl_refs` reference, closing the unit on the last one.
    pub(crate) fn unload_if_last_use(&self) {
        let Some(ext) = self.dynamic() else {
            return;
        };
        let mut state = ext.lock();
        if state.dl_refs == 0 {
            tracing::warn!(module_id = self.module_id, "unbalanced dynamic unload ignored");
            return;
        }
        state.dl_refs -= 1;
        if state.dl_refs > 0 {
            return;
        }

        state.entry_points = None;
        state.from_fallback = false;
        if let Some(unit) = state.unit.take() {
            tracing::debug!(
                module_id = self.module_id,
                path = %unit.path().display(),
                "closing loadable unit"
            );
            drop(unit);
            self.counters.unit_closed();
        }
    }

    /// Gives back one `mem_refs` reference, ending the node on the last one.
    pub(crate) fn drop_if_last_holder(&self) {
        if self.mem_refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.end();
    }

    /// Two-phase release of a holder. The unit is unloaded before the holder
    /// count can reach zero, while the node is still guaranteed alive.
    pub(crate) fn release_holder(&self, dynamic_use: bool) {
        if dynamic_use {
            self.unload_if_last_use();
        }
        self.drop_if_last_holder();
    }

    fn end(&self) {
        if let Some(ext) = self.dynamic() {
            let mut state = ext.lock();
            if let Some(unit) = state.unit.take() {
                tracing::warn!(
                    module_id = self.module_id,
                    dl_refs = state.dl_refs,
                    "freeing node with its unit still loaded"
                );
                drop(unit);
                self.counters.unit_closed();
            }
            state.dl_refs = 0;
            state.entry_points = None;
        }
        self.counters.node_freed();
        tracing::debug!(module_id = self.module_id, "module node freed");
    }

    pub(crate) fn info(&self) -> ModuleInfo {
        let (dl_refs, loaded, from_fallback) = match self.dynamic() {
            Some(ext) => {
                let state = ext.lock();
                (Some(state.dl_refs), state.is_loaded(), state.from_fallback)
            }
            None => (None, false, false),
        };
        ModuleInfo {
            module_id: self.module_id,
            module_type: self.module_type,
            interface_type: self.interface_type(),
            is_static: self.is_static(),
            is_built_in: self.is_built_in,
            mem_refs: self.mem_refs(),
            dl_refs,
            loaded,
            from_fallback,
            tag: self.dynamic().map(|ext| ext.tag().to_owned()),
            source_path: self.dynamic().map(|ext| ext.source_path().to_path_buf()),
        }
    }
}

impl fmt::Debug for ModuleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ModuleNode");
        debug
            .field("module_id", &self.module_id)
            .field("module_type", &self.module_type)
            .field("interface_type", &self.interface_type())
            .field("is_built_in", &self.is_built_in)
            .field("mem_refs", &self.mem_refs());
        if let Some(ext) = self.dynamic() {
            debug
                .field("tag", &ext.tag())
                .field("source_path", &ext.source_path());
        }
        debug.finish()
    }
}

/// Read-only description of a registered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub module_id: u32,
    pub module_type: ModuleType,
    pub interface_type: InterfaceType,
    pub is_static: bool,
    pub is_built_in: bool,
    pub mem_refs: usize,
    pub dl_refs: Option<u32>,
    pub loaded: bool,
    pub from_fallback: bool,
    pub tag: Option<String>,
    pub source_path: Option<PathBuf>,
}

/// A counted reference to a node. Holds one `mem_refs` reference and gives it
/// back when dropped.
pub struct NodeRef {
    node: Arc<ModuleNode>,
}

impl NodeRef {
    /// Wraps a freshly created node, taking over its initial reference.
    pub(crate) fn adopt(node: ModuleNode) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    pub(crate) fn into_handle(
        self,
        entry_points: Option<EntryPoints>,
        dynamic: bool,
        from_fallback: bool,
    ) -> ModuleHandle {
        self.node.add_holder();
        ModuleHandle {
            node: Arc::clone(&self.node),
            entry_points,
            holds_dl_ref: dynamic,
            from_fallback,
        }
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        self.node.add_holder();
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl std::ops::Deref for NodeRef {
    type Target = ModuleNode;

    fn deref(&self) -> &ModuleNode {
        &self.node
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        self.node.release_holder(false);
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.node, f)
    }
}

/// A module resolved for use.
///
/// The handle owns one `mem_refs` reference and, for dynamic modules, one
/// `dl_refs` reference, so its entry points stay valid until it is released or
/// dropped.
pub struct ModuleHandle {
    node: Arc<ModuleNode>,
    entry_points: Option<EntryPoints>,
    holds_dl_ref: bool,
    from_fallback: bool,
}

impl ModuleHandle {
    pub fn module_id(&self) -> u32 {
        self.node.module_id()
    }

    pub fn module_type(&self) -> ModuleType {
        self.node.module_type()
    }

    pub fn interface_type(&self) -> InterfaceType {
        self.node.interface_type()
    }

    /// Resolved entry points, `None` for stubs.
    ///
    /// The borrow is tied to the handle. Calling through a copy after the
    /// handle is released is undefined behaviour, which is why
    /// [`EntryPoints::static_properties`] is `unsafe`.
    pub fn entry_points(&self) -> Option<&EntryPoints> {
        self.entry_points.as_ref()
    }

    pub fn static_properties(&self) -> Result<StaticProperties, ModuleDbError> {
        let entry_points = self.entry_points.ok_or_else(|| {
            ModuleDbError::Unsupported(format!(
                "module 0x{:X} is a stub",
                self.node.module_id()
            ))
        })?;
        // Safety: this handle holds a `dl_refs` reference, so the unit stays mapped.
        unsafe { entry_points.static_properties() }.map_err(|status| {
            ModuleDbError::load_failure(
                self.node.module_id(),
                format!("static properties query returned {status}"),
            )
        })
    }

    pub fn is_dynamic(&self) -> bool {
        !self.node.is_static()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.node.dynamic().map(DynamicExtension::source_path)
    }

    pub fn tag(&self) -> Option<&str> {
        self.node.dynamic().map(DynamicExtension::tag)
    }

    /// Whether the entry points came from the static fallback table because the
    /// unit could not be opened.
    pub fn is_fallback(&self) -> bool {
        self.from_fallback
    }

    /// Releases the handle now instead of at the end of its scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        self.node.release_holder(self.holds_dl_ref);
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("module_id", &self.node.module_id())
            .field("interface_type", &self.node.interface_type())
            .field("entry_points", &self.entry_points)
            .field("dynamic", &self.holds_dl_ref)
            .field("from_fallback", &self.from_fallback)
            .finish()
    }
}

/// One entry of a handle batch: the requested id in, the resolution out.
#[derive(Debug)]
pub struct HandleInfo {
    pub module_id: u32,
    pub interface_type: Option<InterfaceType>,
    pub module_type: Option<ModuleType>,
    pub handle: Option<ModuleHandle>,
    pub result: Result<(), ModuleDbError>,
}

impl HandleInfo {
    pub fn new(module_id: u32) -> Self {
        Self {
            module_id,
            interface_type: None,
            module_type: None,
            handle: None,
            result: Ok(()),
        }
    }

    /// Builds one entry per id, in order.
    pub fn batch(module_ids: &[u32]) -> Vec<Self> {
        module_ids.iter().copied().map(Self::new).collect()
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_ok() && self.handle.is_some()
    }

    pub(crate) fn fail(&mut self, err: ModuleDbError) {
        self.handle = None;
        self.result = Err(err);
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::c_void;

    use pretty_assertions::assert_eq;

    use super::*;

    unsafe extern "C" fn props(props: *mut StaticProperties) -> i32 {
        (*props).version_major = 1;
        0
    }

    unsafe extern "C" fn init(_instance: *mut c_void) -> i32 {
        0
    }

    fn node(source: ModuleSource, counters: &Arc<Counters>) -> NodeRef {
        let registration = ModuleRegistration::new(ModuleType::GENERIC, 0x10, source);
        NodeRef::adopt(ModuleNode::new(registration, Arc::clone(counters)).unwrap())
    }

    #[test]
    fn dynamic_node_needs_tag_and_path() {
        let counters = Arc::new(Counters::default());
        for source in [
            ModuleSource::dynamic("", "foo"),
            ModuleSource::dynamic("/lib/foo.so", ""),
        ] {
            let registration = ModuleRegistration::new(ModuleType::GENERIC, 1, source);
            let err = ModuleNode::new(registration, Arc::clone(&counters)).unwrap_err();
            assert!(matches!(err, ModuleDbError::BadParam(_)));
        }
        assert_eq!(counters.snapshot().nodes_live, 0);
    }

    #[test]
    fn static_node_resolves_immediately() {
        let counters = Arc::new(Counters::default());
        let entry = node(
            ModuleSource::Static(EntryPoints::new(props, init)),
            &counters,
        );
        assert!(entry.is_static());
        assert_eq!(entry.interface_type(), InterfaceType::Module);
        assert_eq!(entry.dl_refs(), None);

        let Acquisition::Ready {
            entry_points,
            dynamic,
            ..
        } = entry.acquire_if_loaded()
        else {
            panic!("static nodes never need a load");
        };
        assert!(!dynamic);
        let handle = entry.clone().into_handle(entry_points, dynamic, false);
        assert_eq!(entry.mem_refs(), 2);
        assert_eq!(handle.static_properties().unwrap().version_major, 1);
        handle.release();
        assert_eq!(entry.mem_refs(), 1);
    }

    #[test]
    fn unloaded_dynamic_node_asks_for_a_load() {
        let counters = Arc::new(Counters::default());
        let entry = node(ModuleSource::dynamic("/lib/foo.so", "foo"), &counters);
        assert!(!entry.is_static());
        assert!(matches!(entry.acquire_if_loaded(), Acquisition::NeedsLoad));
        assert_eq!(entry.dl_refs(), Some(0));
    }

    #[test]
    fn stub_handle_has_no_entry_points() {
        let counters = Arc::new(Counters::default());
        let stub = node(ModuleSource::Stub, &counters);
        assert_eq!(stub.interface_type(), InterfaceType::Stub);
        let handle = stub.clone().into_handle(None, false, false);
        assert!(matches!(
            handle.static_properties(),
            Err(ModuleDbError::Unsupported(_))
        ));
    }

    #[test]
    fn last_holder_frees_the_node() {
        let counters = Arc::new(Counters::default());
        let registry_entry = node(ModuleSource::Stub, &counters);
        let holder = registry_entry.clone();
        assert_eq!(counters.snapshot().nodes_live, 1);

        drop(registry_entry);
        assert_eq!(holder.mem_refs(), 1);
        assert_eq!(counters.snapshot().nodes_live, 1);

        drop(holder);
        assert_eq!(counters.snapshot().nodes_live, 0);
    }
}
