//! The module database: registration, handle acquisition and lifecycle commands.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::builtin::{BuiltinModules, BuiltinReport};
use crate::config::ModuleDbConfig;
use crate::dynamic::{query_version, DynamicLoader};
use crate::entry::ModuleVersion;
use crate::error::ModuleDbError;
use crate::linker::{DynamicLinker, LibLoadingLinker};
use crate::loader::{Completion, ParallelLoader};
use crate::metrics::{Counters, ModuleDbMetrics};
use crate::node::{Acquisition, HandleInfo, ModuleHandle, ModuleInfo, NodeKind, NodeRef};
use crate::registration::{ModuleRecord, ModuleRegistration, ModuleSource};
use crate::registry::Registry;
use crate::voter::{CountingVoter, ResourceVoter};

/// Opaque reference to a handle kept by [`ModuleDatabase::load_modules`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadToken(pub u32);

/// Per-module outcome of a tracked load.
pub type LoadResult = (u32, Result<LoadToken, ModuleDbError>);

#[derive(Default)]
struct LoadTable {
    handles: Mutex<HashMap<LoadToken, ModuleHandle>>,
    next: AtomicU32,
}

impl LoadTable {
    fn track(&self, handle: ModuleHandle) -> LoadToken {
        let token = LoadToken(self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1));
        self.handles.lock().insert(token, handle);
        token
    }

    fn track_batch(&self, batch: Vec<HandleInfo>) -> Vec<LoadResult> {
        batch
            .into_iter()
            .map(|info| {
                let outcome = match (info.result, info.handle) {
                    (Ok(()), Some(handle)) => Ok(self.track(handle)),
                    (Ok(()), None) => Err(ModuleDbError::load_failure(info.module_id, "no handle")),
                    (Err(err), _) => Err(err),
                };
                (info.module_id, outcome)
            })
            .collect()
    }

    fn untrack(&self, token: LoadToken) -> Option<ModuleHandle> {
        self.handles.lock().remove(&token)
    }

    fn drain(&self) -> Vec<ModuleHandle> {
        self.handles.lock().drain().map(|(_, handle)| handle).collect()
    }

    fn len(&self) -> usize {
        self.handles.lock().len()
    }
}

/// Parks the submitting thread of a batch until the loader completes it.
#[derive(Default)]
struct BatchWaiter {
    done: Mutex<Option<Vec<HandleInfo>>>,
    ready: Condvar,
}

impl BatchWaiter {
    fn complete(&self, batch: Vec<HandleInfo>) {
        *self.done.lock() = Some(batch);
        self.ready.notify_all();
    }

    fn wait(&self) -> Vec<HandleInfo> {
        let mut done = self.done.lock();
        loop {
            if let Some(batch) = done.take() {
                return batch;
            }
            self.ready.wait(&mut done);
        }
    }
}

pub struct ModuleDatabaseBuilder {
    config: ModuleDbConfig,
    linker: Option<Arc<dyn DynamicLinker>>,
    voter: Option<Arc<dyn ResourceVoter>>,
    builtins: BuiltinModules,
}

impl ModuleDatabaseBuilder {
    pub fn linker(mut self, linker: Arc<dyn DynamicLinker>) -> Self {
        self.linker = Some(linker);
        self
    }

    pub fn voter(mut self, voter: Arc<dyn ResourceVoter>) -> Self {
        self.voter = Some(voter);
        self
    }

    pub fn builtins(mut self, builtins: BuiltinModules) -> Self {
        self.builtins = builtins;
        self
    }

    /// Launches the loader and registers the built-in modules.
    pub fn build(self) -> Result<ModuleDatabase, ModuleDbError> {
        let Self {
            config,
            linker,
            voter,
            mut builtins,
        } = self;
        config
            .validate()
            .map_err(|err| ModuleDbError::BadParam(err.to_string()))?;

        builtins
            .dynamic_modules
            .extend(config.dynamic_modules.iter().cloned());
        builtins.stub_modules.extend(config.stub_modules.iter().cloned());

        let counters = Arc::new(Counters::default());
        let linker = linker.unwrap_or_else(|| Arc::new(LibLoadingLinker));
        let voter = voter.unwrap_or_else(|| Arc::new(CountingVoter::new()));
        let dynamic = Arc::new(DynamicLoader::new(
            linker,
            builtins.fallback_table(),
            Arc::clone(&counters),
            config.slow_load_warning(),
        ));
        let loader = ParallelLoader::launch(
            config.loader_limits(),
            Arc::clone(&dynamic),
            Arc::clone(&voter),
            Arc::clone(&counters),
        )?;

        let registry = Registry::new(Arc::clone(&counters));
        let report = builtins.register_into(&registry);

        tracing::info!(
            workers = loader.worker_count(),
            modules = registry.len(),
            "module database initialised"
        );

        Ok(ModuleDatabase {
            config,
            builtins,
            counters,
            registry,
            dynamic,
            voter,
            loader: RwLock::new(loader),
            loads: Arc::new(LoadTable::default()),
            builtin_report: Mutex::new(report),
        })
    }
}

/// Registry of processing modules with a parallel on-demand loader.
///
/// Handle batches resolve static and already-loaded modules on the calling
/// thread; everything else is loaded by the worker pool.
pub struct ModuleDatabase {
    config: ModuleDbConfig,
    builtins: BuiltinModules,
    counters: Arc<Counters>,
    registry: Registry,
    dynamic: Arc<DynamicLoader>,
    voter: Arc<dyn ResourceVoter>,
    loader: RwLock<ParallelLoader>,
    loads: Arc<LoadTable>,
    builtin_report: Mutex<BuiltinReport>,
}

impl ModuleDatabase {
    pub fn builder(config: ModuleDbConfig) -> ModuleDatabaseBuilder {
        ModuleDatabaseBuilder {
            config,
            linker: None,
            voter: None,
            builtins: BuiltinModules::default(),
        }
    }

    pub fn new(config: ModuleDbConfig) -> Result<Self, ModuleDbError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ModuleDbConfig {
        &self.config
    }

    pub fn register(&self, registration: ModuleRegistration) -> Result<(), ModuleDbError> {
        let module_id = registration.module_id;
        self.registry.insert(registration).map_err(|err| {
            tracing::warn!(module_id, error = %err, "module registration rejected");
            err
        })
    }

    pub fn deregister(&self, module_id: u32) -> Result<(), ModuleDbError> {
        self.registry.remove(module_id)
    }

    /// Looks a node up and takes a reference that keeps it alive while held.
    pub fn find(&self, module_id: u32) -> Option<NodeRef> {
        self.registry.find(module_id)
    }

    /// Describes a registered node without taking a reference on it.
    pub fn module_info(&self, module_id: u32) -> Option<ModuleInfo> {
        self.registry.info(module_id)
    }

    pub fn module_ids(&self) -> Vec<u32> {
        self.registry.module_ids()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> ModuleDbMetrics {
        self.counters.snapshot()
    }

    pub fn builtin_report(&self) -> BuiltinReport {
        self.builtin_report.lock().clone()
    }

    pub fn worker_count(&self) -> usize {
        self.loader.read().worker_count()
    }

    /// Resolves `module_ids` to handles, blocking until every entry is settled.
    pub fn request_handles(&self, module_ids: &[u32]) -> Vec<HandleInfo> {
        self.resolve_batch(HandleInfo::batch(module_ids))
    }

    /// Blocking form of [`request_handles_with`](Self::request_handles_with).
    pub fn resolve_batch(&self, batch: Vec<HandleInfo>) -> Vec<HandleInfo> {
        let waiter = Arc::new(BatchWaiter::default());
        let notify = Arc::clone(&waiter);
        self.submit(batch, Box::new(move |batch| notify.complete(batch)));
        waiter.wait()
    }

    /// Resolves a batch and hands it to `callback` once every entry is settled.
    ///
    /// When nothing in the batch needs a load the callback runs on the calling
    /// thread before this returns; otherwise it runs on a loader thread.
    pub fn request_handles_with<F>(&self, batch: Vec<HandleInfo>, callback: F)
    where
        F: FnOnce(Vec<HandleInfo>) + Send + 'static,
    {
        self.submit(batch, Box::new(callback));
    }

    fn submit(&self, mut batch: Vec<HandleInfo>, callback: Completion) {
        let mut pending = Vec::new();
        for (index, info) in batch.iter_mut().enumerate() {
            let Some(node) = self.registry.find(info.module_id) else {
                info.fail(ModuleDbError::NotFound(info.module_id));
                continue;
            };
            info.interface_type = Some(node.interface_type());
            info.module_type = Some(node.module_type());
            match node.acquire_if_loaded() {
                Acquisition::Ready {
                    entry_points,
                    dynamic,
                    from_fallback,
                } => {
                    info.handle = Some(node.into_handle(entry_points, dynamic, from_fallback));
                    info.result = Ok(());
                }
                Acquisition::NeedsLoad => pending.push((index, node)),
            }
        }

        if pending.is_empty() {
            callback(batch);
            return;
        }

        let loader = self.loader.read();
        let session = match loader.get_session(batch, callback) {
            Ok(session) => session,
            Err((err, mut batch, callback)) => {
                drop(loader);
                for (index, node) in pending {
                    drop(node);
                    if let Some(info) = batch.get_mut(index) {
                        info.fail(err.clone());
                    }
                }
                callback(batch);
                return;
            }
        };
        for (index, node) in pending {
            loader.push_task(&session, index, node);
        }
        // The callback may run below and is free to reset the database.
        drop(loader);
        ParallelLoader::release_session(&session);
    }

    /// Releases every handle in `batch`, returning how many were released.
    ///
    /// Failed and empty entries are skipped.
    pub fn release_handles(&self, batch: &mut [HandleInfo]) -> usize {
        let mut released = 0;
        for info in batch.iter_mut() {
            if let Some(handle) = info.handle.take() {
                handle.release();
                released += 1;
            }
        }
        released
    }

    /// Registers caller-supplied dynamic modules. Each record succeeds or fails on its own.
    pub fn register_custom_modules(&self, records: &[ModuleRecord]) -> Vec<Result<(), ModuleDbError>> {
        records
            .iter()
            .map(|record| {
                let registration = record.to_registration(false)?;
                if !matches!(registration.source, ModuleSource::Dynamic { .. }) {
                    return Err(ModuleDbError::BadParam(format!(
                        "custom module 0x{:X} needs a source path and tag",
                        record.module_id
                    )));
                }
                self.register(registration)
            })
            .collect()
    }

    pub fn deregister_custom_modules(&self, module_ids: &[u32]) -> Vec<Result<(), ModuleDbError>> {
        module_ids.iter().map(|&module_id| self.deregister(module_id)).collect()
    }

    /// Acquires handles and keeps them in the load table until unloaded.
    pub fn load_modules(&self, module_ids: &[u32]) -> Vec<LoadResult> {
        let batch = self.request_handles(module_ids);
        self.loads.track_batch(batch)
    }

    /// Non-blocking form of [`load_modules`](Self::load_modules).
    pub fn load_modules_with<F>(&self, module_ids: &[u32], callback: F)
    where
        F: FnOnce(Vec<LoadResult>) + Send + 'static,
    {
        let loads = Arc::clone(&self.loads);
        self.request_handles_with(HandleInfo::batch(module_ids), move |batch| {
            callback(loads.track_batch(batch))
        });
    }

    pub fn unload_modules(&self, tokens: &[LoadToken]) -> Vec<Result<(), ModuleDbError>> {
        tokens
            .iter()
            .map(|&token| match self.loads.untrack(token) {
                Some(handle) => {
                    handle.release();
                    Ok(())
                }
                None => Err(ModuleDbError::NotFound(token.0)),
            })
            .collect()
    }

    /// Handles currently held by the load table.
    pub fn tracked_loads(&self) -> usize {
        self.loads.len()
    }

    pub fn module_version(&self, module_id: u32) -> Result<ModuleVersion, ModuleDbError> {
        let node = self
            .registry
            .find(module_id)
            .ok_or(ModuleDbError::NotFound(module_id))?;
        match node.kind() {
            NodeKind::Stub => Err(ModuleDbError::Unsupported(format!(
                "module 0x{module_id:X} is a stub"
            ))),
            // Safety: static entry points are linked into the image.
            NodeKind::Static(entry_points) => unsafe { query_version(module_id, entry_points) },
            NodeKind::Dynamic(_) => self.dynamic.version(&node),
        }
    }

    /// Recovers from a bad state.
    ///
    /// `flush` releases every handle in the load table. `reinit` restarts the
    /// loader, drops the registry's reference to every node and registers the
    /// built-in modules again.
    pub fn reset(&self, flush: bool, reinit: bool) -> Result<(), ModuleDbError> {
        if flush {
            let flushed = self.loads.drain();
            tracing::info!(count = flushed.len(), "flushing tracked module loads");
            drop(flushed);
        }
        if !reinit {
            return Ok(());
        }

        let mut loader = self.loader.write();
        loader.shutdown();
        self.registry.clear();
        *loader = ParallelLoader::launch(
            self.config.loader_limits(),
            Arc::clone(&self.dynamic),
            Arc::clone(&self.voter),
            Arc::clone(&self.counters),
        )?;
        *self.builtin_report.lock() = self.builtins.register_into(&self.registry);
        tracing::info!(modules = self.registry.len(), "module database reinitialised");
        Ok(())
    }
}

impl Drop for ModuleDatabase {
    fn drop(&mut self) {
        self.loader.get_mut().shutdown();
        drop(self.loads.drain());
        self.registry.clear();
    }
}

impl fmt::Debug for ModuleDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDatabase")
            .field("modules", &self.registry.len())
            .field("tracked_loads", &self.loads.len())
            .field("loader", &*self.loader.read())
            .field("dynamic", &self.dynamic)
            .finish()
    }
}
