//! Process-global table of active block controllers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use super::Controller;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// `RwLock<HashMap<BlockId, Arc<Controller>>>`. Replacing a controller for a
/// block always stops the predecessor first, under the write lock, so no
/// two controllers for the same block ever run concurrently.
pub struct Registry {
    controllers: RwLock<HashMap<String, Arc<Controller>>>,
}

impl Registry {
    fn new() -> Self {
        Registry { controllers: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, block_id: &str) -> Option<Arc<Controller>> {
        self.controllers.read().unwrap().get(block_id).cloned()
    }

    /// Install `new` for `block_id`, stopping and returning any predecessor.
    pub fn replace(&self, block_id: &str, new: Arc<Controller>) -> Option<Arc<Controller>> {
        self.controllers.write().unwrap().insert(block_id.to_string(), new)
    }

    pub fn remove(&self, block_id: &str) -> Option<Arc<Controller>> {
        self.controllers.write().unwrap().remove(block_id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
