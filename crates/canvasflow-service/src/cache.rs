//! Compiled-schema cache.
//!
//! Compilation is deterministic per draft state, so schemas cache under
//! `(workflow_id, commit_id)`: every save mints a new commit id, which
//! makes stale hits impossible, and writers still invalidate the whole
//! workflow on publish to bound memory.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use canvasflow_core::schema::WorkflowSchema;

const DEFAULT_CAPACITY: usize = 256;

pub struct SchemaCache {
    inner: Mutex<LruCache<(i64, i64), Arc<WorkflowSchema>>>,
}

impl SchemaCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, workflow_id: i64, commit_id: i64) -> Option<Arc<WorkflowSchema>> {
        self.inner
            .lock()
            .expect("schema cache poisoned")
            .get(&(workflow_id, commit_id))
            .cloned()
    }

    pub fn put(&self, workflow_id: i64, commit_id: i64, schema: Arc<WorkflowSchema>) {
        self.inner
            .lock()
            .expect("schema cache poisoned")
            .put((workflow_id, commit_id), schema);
    }

    /// Drop every cached compile of one workflow.
    pub fn invalidate(&self, workflow_id: i64) {
        let mut inner = self.inner.lock().expect("schema cache poisoned");
        let stale: Vec<(i64, i64)> = inner
            .iter()
            .map(|(key, _)| *key)
            .filter(|(id, _)| *id == workflow_id)
            .collect();
        for key in stale {
            inner.pop(&key);
        }
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_per_commit_and_invalidates_per_workflow() {
        let cache = SchemaCache::new(8);
        let schema = Arc::new(WorkflowSchema::default());
        cache.put(1, 100, Arc::clone(&schema));
        cache.put(1, 101, Arc::clone(&schema));
        cache.put(2, 100, Arc::clone(&schema));

        assert!(cache.get(1, 100).is_some());
        assert!(cache.get(1, 99).is_none());

        cache.invalidate(1);
        assert!(cache.get(1, 100).is_none());
        assert!(cache.get(1, 101).is_none());
        assert!(cache.get(2, 100).is_some());
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let cache = SchemaCache::new(2);
        let schema = Arc::new(WorkflowSchema::default());
        cache.put(1, 1, Arc::clone(&schema));
        cache.put(2, 1, Arc::clone(&schema));
        cache.get(1, 1);
        cache.put(3, 1, schema);
        assert!(cache.get(2, 1).is_none());
        assert!(cache.get(1, 1).is_some());
    }
}
