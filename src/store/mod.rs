use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory key-value state machine.
///
/// Mutated only by the apply path, after WAL durability; reads may run
/// concurrently from any connection handler.
#[derive(Default)]
pub struct KvStore {
    data: RwLock<HashMap<String, String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.data.write().unwrap().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().unwrap().get(key).cloned()
    }

    /// Consistent copy of all pairs, for snapshot creation.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.data.read().unwrap().clone()
    }

    /// Replace the entire contents atomically, for snapshot restore.
    pub fn restore(&self, pairs: HashMap<String, String>) {
        *self.data.write().unwrap() = pairs;
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
