use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::loader::LoaderLimits;
use crate::registration::ModuleRecord;

pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const DEFAULT_TASK_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_SESSION_POOL_SIZE: usize = 8;

/// Tunables of the module database, read from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleDbConfig {
    /// Threads in the parallel loader pool.
    pub worker_threads: usize,
    /// Capacity of the loader's task queue.
    pub task_queue_depth: usize,
    /// Batches that may wait on the loader at the same time.
    pub session_pool_size: usize,
    /// Loads slower than this are logged as warnings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_load_warning_ms: Option<u64>,
    /// Built-in dynamic modules.
    pub dynamic_modules: Vec<ModuleRecord>,
    /// Built-in placeholder ids.
    pub stub_modules: Vec<ModuleRecord>,
}

impl Default for ModuleDbConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            task_queue_depth: DEFAULT_TASK_QUEUE_DEPTH,
            session_pool_size: DEFAULT_SESSION_POOL_SIZE,
            slow_load_warning_ms: None,
            dynamic_modules: Vec::new(),
            stub_modules: Vec::new(),
        }
    }
}

impl ModuleDbConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("worker_threads", self.worker_threads),
            ("task_queue_depth", self.task_queue_depth),
            ("session_pool_size", self.session_pool_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if let Some(stub) = self
            .stub_modules
            .iter()
            .find(|record| record.source_path.is_some() || record.tag.is_some())
        {
            return Err(ConfigError::Invalid(format!(
                "stub module 0x{:X} must not name a loadable unit",
                stub.module_id
            )));
        }
        Ok(())
    }

    pub fn slow_load_warning(&self) -> Option<Duration> {
        self.slow_load_warning_ms.map(Duration::from_millis)
    }

    pub(crate) fn loader_limits(&self) -> LoaderLimits {
        LoaderLimits {
            worker_threads: self.worker_threads,
            task_queue_depth: self.task_queue_depth,
            session_pool_size: self.session_pool_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::ModuleType;

    #[test]
    fn empty_object_uses_defaults() {
        let config = ModuleDbConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ModuleDbConfig::default());
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.task_queue_depth, 64);
        assert_eq!(config.session_pool_size, 8);
    }

    #[test]
    fn loads_modules_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module_db.json");
        std::fs::write(
            &path,
            r#"{
                "worker_threads": 2,
                "slow_load_warning_ms": 250,
                "dynamic_modules": [
                    { "module_type": 3, "module_id": 4096, "source_path": "/lib/foo.so", "tag": "foo" }
                ],
                "stub_modules": [ { "module_type": 2, "module_id": 17 } ]
            }"#,
        )
        .unwrap();

        let config = ModuleDbConfig::load(&path).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.slow_load_warning(), Some(Duration::from_millis(250)));
        assert_eq!(
            config.dynamic_modules,
            vec![ModuleRecord::dynamic(ModuleType::DECODER, 0x1000, "/lib/foo.so", "foo")]
        );
        assert_eq!(config.stub_modules, vec![ModuleRecord::stub(ModuleType::GENERIC, 17)]);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = ModuleDbConfig::from_json_str(r#"{ "session_pool_size": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(message) if message.contains("session_pool_size")));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModuleDbConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(_)));
    }
}
