//! Opening, resolving and falling back for dynamic module nodes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::entry::{symbol_names, EntryPoints, ModuleVersion};
use crate::error::{LinkError, ModuleDbError};
use crate::linker::{DynamicLinker, LoadedUnit};
use crate::metrics::{Counters, SpanTimer};
use crate::node::{DynamicExtension, ModuleNode};

/// Result of a successful [`DynamicLoader::load`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Loaded {
    pub(crate) entry_points: EntryPoints,
    pub(crate) from_fallback: bool,
}

pub(crate) struct DynamicLoader {
    linker: Arc<dyn DynamicLinker>,
    fallback: HashMap<u32, EntryPoints>,
    counters: Arc<Counters>,
    slow_load_warning: Option<Duration>,
}

impl DynamicLoader {
    pub(crate) fn new(
        linker: Arc<dyn DynamicLinker>,
        fallback: HashMap<u32, EntryPoints>,
        counters: Arc<Counters>,
        slow_load_warning: Option<Duration>,
    ) -> Self {
        Self {
            linker,
            fallback,
            counters,
            slow_load_warning,
        }
    }

    /// Takes one `dl_refs` reference on `node`, opening its unit if nobody holds one.
    ///
    /// Runs entirely under the node's load lock, so concurrent loads of the same
    /// node open the unit once while different nodes load in parallel.
    pub(crate) fn load(&self, node: &ModuleNode) -> Result<Loaded, ModuleDbError> {
        let module_id = node.module_id();
        let ext = node.dynamic().ok_or_else(|| {
            ModuleDbError::BadParam(format!("module 0x{module_id:X} is not dynamic"))
        })?;

        let mut state = ext.lock();
        if state.is_loaded() {
            let entry_points = state.entry_points.ok_or_else(|| {
                ModuleDbError::load_failure(module_id, "loaded node has no entry points")
            })?;
            state.dl_refs += 1;
            return Ok(Loaded {
                entry_points,
                from_fallback: state.from_fallback,
            });
        }

        let timer = SpanTimer::new("module_db::dynamic_load");
        let opened = self.open_and_resolve(module_id, ext);
        let elapsed = timer.finish();
        if let Some(limit) = self.slow_load_warning {
            if elapsed > limit {
                tracing::warn!(
                    module_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    limit_ms = limit.as_millis() as u64,
                    "dynamic load exceeded its time budget"
                );
            }
        }

        match opened {
            Ok((unit, entry_points)) => {
                tracing::info!(
                    module_id,
                    tag = ext.tag(),
                    path = %unit.path().display(),
                    "loaded dynamic module"
                );
                state.unit = Some(unit);
                state.entry_points = Some(entry_points);
                state.from_fallback = false;
                state.dl_refs = 1;
                Ok(Loaded {
                    entry_points,
                    from_fallback: false,
                })
            }
            Err(OpenFailure::Open(err)) => match self.fallback.get(&module_id) {
                Some(entry_points) => {
                    state.unit = None;
                    state.entry_points = Some(*entry_points);
                    state.from_fallback = true;
                    state.dl_refs = 1;
                    self.counters.fallback_taken();
                    tracing::warn!(
                        module_id,
                        path = %ext.source_path().display(),
                        error = %err,
                        "unit failed to open, using static fallback"
                    );
                    Ok(Loaded {
                        entry_points: *entry_points,
                        from_fallback: true,
                    })
                }
                None => Err(self.failed(module_id, err)),
            },
            Err(OpenFailure::Resolve(err)) => Err(self.failed(module_id, err)),
        }
    }

    /// Reads the version from the node's static-properties entry point.
    ///
    /// A loaded node answers from its resolved entry points. Otherwise the unit
    /// is opened just for the query and closed again; `dl_refs` is unchanged.
    pub(crate) fn version(&self, node: &ModuleNode) -> Result<ModuleVersion, ModuleDbError> {
        let module_id = node.module_id();
        let Some(ext) = node.dynamic() else {
            return Err(ModuleDbError::BadParam(format!(
                "module 0x{module_id:X} is not dynamic"
            )));
        };

        let state = ext.lock();
        if let Some(entry_points) = state.entry_points {
            // Safety: the load lock is held, so the installed unit cannot close.
            return unsafe { query_version(module_id, &entry_points) };
        }

        let (unit, entry_points) = match self.open_and_resolve(module_id, ext) {
            Ok(opened) => opened,
            Err(OpenFailure::Open(err)) => match self.fallback.get(&module_id) {
                // Safety: fallback entry points are linked into the image.
                Some(entry_points) => return unsafe { query_version(module_id, entry_points) },
                None => return Err(self.failed(module_id, err)),
            },
            Err(OpenFailure::Resolve(err)) => return Err(self.failed(module_id, err)),
        };
        // Safety: `unit` is only dropped after the query returns.
        let version = unsafe { query_version(module_id, &entry_points) };
        tracing::debug!(module_id, path = %unit.path().display(), "closing unit after version query");
        drop(unit);
        self.counters.unit_closed();
        version
    }

    fn open_and_resolve(
        &self,
        module_id: u32,
        ext: &DynamicExtension,
    ) -> Result<(Box<dyn LoadedUnit>, EntryPoints), OpenFailure> {
        let unit = self.linker.open(ext.source_path()).map_err(OpenFailure::Open)?;
        self.counters.unit_opened();

        let (props_name, init_name) = symbol_names(ext.tag());
        let resolved = unit
            .symbol(&props_name)
            .and_then(|props| unit.symbol(&init_name).map(|init| (props, init)));
        match resolved {
            Ok((props, init)) => {
                // Safety: the unit exports these names under the module ABI and stays
                // open for as long as the entry points are installed on the node.
                let entry_points = unsafe { EntryPoints::from_raw(props, init) };
                Ok((unit, entry_points))
            }
            Err(err) => {
                tracing::debug!(
                    module_id,
                    path = %unit.path().display(),
                    error = %err,
                    "closing unit after failed symbol lookup"
                );
                drop(unit);
                self.counters.unit_closed();
                Err(OpenFailure::Resolve(err))
            }
        }
    }

    fn failed(&self, module_id: u32, err: LinkError) -> ModuleDbError {
        self.counters.load_failed();
        tracing::error!(module_id, error = %err, "dynamic load failed");
        ModuleDbError::load_failure(module_id, err)
    }
}

impl fmt::Debug for DynamicLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicLoader")
            .field("fallback_modules", &self.fallback.len())
            .field("slow_load_warning", &self.slow_load_warning)
            .finish()
    }
}

enum OpenFailure {
    /// The unit could not be opened; the static fallback may still apply.
    Open(LinkError),
    /// The unit opened but lacks an entry point.
    Resolve(LinkError),
}

/// # Safety
///
/// The code behind `entry_points` must stay mapped for the duration of the call.
pub(crate) unsafe fn query_version(
    module_id: u32,
    entry_points: &EntryPoints,
) -> Result<ModuleVersion, ModuleDbError> {
    let props = entry_points.static_properties().map_err(|status| {
        ModuleDbError::load_failure(module_id, format!("static properties query returned {status}"))
    })?;
    Ok(ModuleVersion {
        major: props.version_major,
        minor: props.version_minor,
    })
}
