use crate::model::DEFAULT_TAG;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Key of a manifest push: `repository:tag`, an empty tag meaning `latest`.
pub fn inflight_key(repository: &str, tag: &str) -> String {
    let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };
    format!("{}:{}", repository, tag)
}

/// Set of manifest pushes currently running, shared by every request.
#[derive(Debug, Default)]
pub struct InflightTracker {
    active: Mutex<HashSet<String>>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `key`. False when someone else holds it.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string())
    }

    pub fn release(&self, key: &str) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Claim `key` and release it when the returned guard is dropped.
    pub fn guard(self: &Arc<Self>, key: impl Into<String>) -> Option<InflightGuard> {
        let key = key.into();
        if self.try_acquire(&key) {
            Some(InflightGuard {
                tracker: self.clone(),
                key,
            })
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct InflightGuard {
    tracker: Arc<InflightTracker>,
    key: String,
}

impl InflightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.key);
    }
}
