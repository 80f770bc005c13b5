//! Keyed store of registered module nodes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ModuleDbError;
use crate::metrics::Counters;
use crate::node::{ModuleInfo, ModuleNode, NodeRef};
use crate::registration::ModuleRegistration;

/// Index of nodes by module id.
///
/// One coarse lock guards insert, lookup and removal. It is never held while a
/// unit is being opened.
pub(crate) struct Registry {
    nodes: Mutex<HashMap<u32, NodeRef>>,
    counters: Arc<Counters>,
}

impl Registry {
    pub(crate) fn new(counters: Arc<Counters>) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            counters,
        }
    }

    pub(crate) fn insert(&self, registration: ModuleRegistration) -> Result<(), ModuleDbError> {
        let module_id = registration.module_id;
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&module_id) {
            return Err(ModuleDbError::AlreadyRegistered(module_id));
        }
        nodes
            .try_reserve(1)
            .map_err(|_| ModuleDbError::OutOfMemory)?;

        let node = ModuleNode::new(registration, Arc::clone(&self.counters))?;
        tracing::debug!(
            module_id,
            module_type = node.module_type().0,
            interface = ?node.interface_type(),
            is_static = node.is_static(),
            is_built_in = node.is_built_in(),
            "registered module"
        );
        nodes.insert(module_id, NodeRef::adopt(node));
        Ok(())
    }

    /// Removes a custom node from lookup and drops the registry's reference.
    ///
    /// Other holders keep the node alive until they release it.
    pub(crate) fn remove(&self, module_id: u32) -> Result<(), ModuleDbError> {
        let removed = {
            let mut nodes = self.nodes.lock();
            let is_built_in = match nodes.get(&module_id) {
                Some(node) => node.is_built_in(),
                None => {
                    return Err(ModuleDbError::Unsupported(format!(
                        "module 0x{module_id:X} is not registered"
                    )))
                }
            };
            if is_built_in {
                return Err(ModuleDbError::Unsupported(format!(
                    "module 0x{module_id:X} is built in"
                )));
            }
            nodes.remove(&module_id)
        };

        if let Some(node) = removed {
            tracing::debug!(
                module_id,
                outstanding = node.mem_refs().saturating_sub(1),
                "deregistered module"
            );
        }
        Ok(())
    }

    /// Looks a node up and takes a reference on it.
    pub(crate) fn find(&self, module_id: u32) -> Option<NodeRef> {
        self.nodes.lock().get(&module_id).cloned()
    }

    pub(crate) fn info(&self, module_id: u32) -> Option<ModuleInfo> {
        self.nodes.lock().get(&module_id).map(|node| node.info())
    }

    pub(crate) fn module_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.nodes.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Empties the index, dropping the registry's reference to every node.
    pub(crate) fn clear(&self) {
        let drained: Vec<NodeRef> = self.nodes.lock().drain().map(|(_, node)| node).collect();
        tracing::debug!(count = drained.len(), "cleared module registry");
        drop(drained);
    }
}
