//! Modules registered when the database starts and again after a reinit.

use std::collections::HashMap;

use crate::entry::{EntryPoints, ModuleType};
use crate::error::ModuleDbError;
use crate::metrics::SpanTimer;
use crate::registration::{ModuleRecord, ModuleRegistration, ModuleSource};
use crate::registry::Registry;

/// A module whose code is linked into the running image.
#[derive(Debug, Clone, Copy)]
pub struct StaticModule {
    pub module_type: ModuleType,
    pub module_id: u32,
    pub entry_points: EntryPoints,
}

/// A dynamic module that falls back to linked-in entry points when its unit
/// cannot be opened.
#[derive(Debug, Clone)]
pub struct FallbackModule {
    pub record: ModuleRecord,
    pub entry_points: EntryPoints,
}

/// Everything the database registers as built in.
#[derive(Debug, Clone, Default)]
pub struct BuiltinModules {
    pub static_modules: Vec<StaticModule>,
    pub dynamic_modules: Vec<ModuleRecord>,
    pub stub_modules: Vec<ModuleRecord>,
    pub fallback_modules: Vec<FallbackModule>,
}

/// Outcome of registering the built-in tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuiltinReport {
    pub registered: usize,
    pub failed: Vec<(u32, ModuleDbError)>,
}

impl BuiltinModules {
    pub fn is_empty(&self) -> bool {
        self.static_modules.is_empty()
            && self.dynamic_modules.is_empty()
            && self.stub_modules.is_empty()
            && self.fallback_modules.is_empty()
    }

    /// Entry points the dynamic loader may install when a unit fails to open.
    pub(crate) fn fallback_table(&self) -> HashMap<u32, EntryPoints> {
        self.fallback_modules
            .iter()
            .map(|module| (module.record.module_id, module.entry_points))
            .collect()
    }

    fn registrations(
        &self,
    ) -> impl Iterator<Item = Result<ModuleRegistration, (u32, ModuleDbError)>> + '_ {
        let with_id = |record: &ModuleRecord| {
            record
                .to_registration(true)
                .map_err(|err| (record.module_id, err))
        };

        let fallback = self
            .fallback_modules
            .iter()
            .map(move |module| with_id(&module.record));
        let dynamic = self.dynamic_modules.iter().map(with_id);
        let fixed = self.static_modules.iter().map(|module| {
            Ok::<_, (u32, ModuleDbError)>(ModuleRegistration::new(
                module.module_type,
                module.module_id,
                ModuleSource::Static(module.entry_points),
            )
            .built_in())
        });
        let stubs = self.stub_modules.iter().map(|record| {
            Ok::<_, (u32, ModuleDbError)>(
                ModuleRegistration::new(record.module_type, record.module_id, ModuleSource::Stub)
                    .built_in(),
            )
        });

        fallback.chain(dynamic).chain(fixed).chain(stubs)
    }

    /// Registers every table into `registry`.
    ///
    /// Order is fallback-capable dynamic modules, dynamic modules, static
    /// modules, then stubs. A failing entry is logged and skipped.
    pub(crate) fn register_into(&self, registry: &Registry) -> BuiltinReport {
        let timer = SpanTimer::new("module_db::register_builtins");
        let mut report = BuiltinReport::default();
        for registration in self.registrations() {
            let outcome = registration.and_then(|registration| {
                let module_id = registration.module_id;
                registry.insert(registration).map_err(|err| (module_id, err))
            });
            match outcome {
                Ok(()) => report.registered += 1,
                Err((module_id, err)) => {
                    tracing::error!(module_id, error = %err, "failed to register built-in module");
                    report.failed.push((module_id, err));
                }
            }
        }
        let elapsed = timer.finish();
        tracing::info!(
            registered = report.registered,
            failed = report.failed.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "registered built-in modules"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::c_void;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::{InterfaceType, StaticProperties};
    use crate::metrics::Counters;

    unsafe extern "C" fn props(_props: *mut StaticProperties) -> i32 {
        0
    }

    unsafe extern "C" fn init(_instance: *mut c_void) -> i32 {
        0
    }

    #[test]
    fn registers_every_table_and_skips_failures() {
        let entry_points = EntryPoints::new(props, init);
        let builtins = BuiltinModules {
            static_modules: vec![StaticModule {
                module_type: ModuleType::GENERIC,
                module_id: 0x20,
                entry_points,
            }],
            dynamic_modules: vec![
                ModuleRecord::dynamic(ModuleType::DECODER, 0x30, "/lib/dec.so", "dec"),
                ModuleRecord::dynamic(ModuleType::DECODER, 0x31, "/lib/bad.so", ""),
            ],
            stub_modules: vec![ModuleRecord::stub(ModuleType::GENERIC, 0x40)],
            fallback_modules: vec![FallbackModule {
                record: ModuleRecord::dynamic(ModuleType::ENCODER, 0x10, "/lib/enc.so", "enc"),
                entry_points,
            }],
        };

        let registry = Registry::new(Arc::new(Counters::default()));
        let report = builtins.register_into(&registry);

        assert_eq!(report.registered, 4);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 0x31);
        assert_eq!(registry.module_ids(), vec![0x10, 0x20, 0x30, 0x40]);

        let stub = registry.info(0x40).unwrap();
        assert_eq!(stub.interface_type, InterfaceType::Stub);
        assert!(stub.is_built_in);
        assert_eq!(builtins.fallback_table().len(), 1);
    }
}
