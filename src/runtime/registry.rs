//! Mutex-guarded queue maps
//!
//! Critical sections are short map operations; no lock is ever held across
//! an `.await`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::network::QueueRef;

/// Map from a key to live queues
pub struct Registry<K> {
    queues: Mutex<HashMap<K, QueueRef>>,
}

impl<K> Default for Registry<K> {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> Registry<K> {
    fn lock(&self) -> MutexGuard<'_, HashMap<K, QueueRef>> {
        // A poisoned map is still structurally valid
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, key: K, queue: QueueRef) {
        self.lock().insert(key, queue);
    }

    /// Fetch the queue for `key`, creating it with `create` under the same
    /// lock. The flag is true when the queue was created by this call.
    pub fn get_or_insert_with(&self, key: K, create: impl FnOnce() -> QueueRef) -> (QueueRef, bool) {
        let mut queues = self.lock();
        if let Some(queue) = queues.get(&key) {
            return (queue.clone(), false);
        }
        let queue = create();
        queues.insert(key, queue.clone());
        (queue, true)
    }

    pub fn get(&self, key: &K) -> Option<QueueRef> {
        self.lock().get(key).cloned()
    }

    /// Remove `key` only if it still maps to `queue`
    pub fn remove_if_same(&self, key: &K, queue: &QueueRef) -> bool {
        let mut queues = self.lock();
        match queues.get(key) {
            Some(current) if Arc::ptr_eq(current, queue) => {
                queues.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current values, for iterating without the lock
    pub fn snapshot(&self) -> Vec<QueueRef> {
        self.lock().values().cloned().collect()
    }

    /// Number of queues matching `pred`
    pub fn count_where(&self, pred: impl Fn(&QueueRef) -> bool) -> usize {
        self.lock().values().filter(|q| pred(q)).count()
    }
}
