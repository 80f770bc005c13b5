//! Module database for Harmoniq processing modules.
//!
//! Modules are registered under a numeric id and backed either by code already
//! linked into the process or by a loadable unit opened on first use. Graph
//! builders request batches of handles; static and already-loaded modules
//! resolve on the calling thread, the rest are loaded by a small worker pool
//! that opens each unit once however many batches ask for it. A unit is closed
//! when its last handle is released, and a node is freed when its last holder
//! lets go, even if it was deregistered earlier.

mod builtin;
mod config;
mod db;
mod dynamic;
mod entry;
mod error;
mod linker;
mod loader;
mod metrics;
mod node;
mod queue;
mod registration;
mod registry;
mod voter;

pub use builtin::{BuiltinModules, BuiltinReport, FallbackModule, StaticModule};
pub use config::{
    ModuleDbConfig, DEFAULT_SESSION_POOL_SIZE, DEFAULT_TASK_QUEUE_DEPTH, DEFAULT_WORKER_THREADS,
};
pub use db::{LoadResult, LoadToken, ModuleDatabase, ModuleDatabaseBuilder};
pub use entry::*;
pub use error::{ConfigError, LinkError, ModuleDbError};
pub use linker::{DynamicLinker, LibLoadingLinker, LibraryUnit, LoadedUnit};
pub use loader::Completion;
pub use metrics::ModuleDbMetrics;
pub use node::{HandleInfo, ModuleHandle, ModuleInfo, ModuleNode, NodeRef};
pub use queue::{BoundedQueue, QueueError};
pub use registration::{ModuleRecord, ModuleRegistration, ModuleSource};
pub use voter::{CountingVoter, ResourceVoter};
