//! Per-cluster exclusive-action locking.
//!
//! Mutating admin operations on a cluster must not interleave. The registry
//! holds a process-wide `cluster → owner` table; acquisition is a single
//! test-and-set and never blocks. A failed acquisition reports the current
//! owner so the caller can requeue. The guard releases on drop, on every
//! exit path.

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

use crate::types::ClusterKey;

/// Process-wide registry of per-cluster action locks.
#[derive(Debug, Default, Clone)]
pub struct ClusterLockRegistry {
    locks: Arc<Mutex<HashMap<String, String>>>,
}

/// Scoped ownership of a cluster's action lock.
#[derive(Debug)]
pub struct ClusterGuard {
    registry: ClusterLockRegistry,
    key: String,
    owner: String,
}

impl ClusterLockRegistry {
    /// Return a new empty `Self`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock for `cluster` on behalf of `owner`. Fails fast
    /// with the current owner's tag when the lock is already held.
    pub fn try_acquire(&self, cluster: &ClusterKey, owner: &str) -> Result<ClusterGuard, String> {
        let key = cluster.to_string();
        let mut locks = self.locks.lock();
        match locks.get(&key) {
            Some(current) => Err(current.clone()),
            None => {
                locks.insert(key.clone(), owner.to_string());
                Ok(ClusterGuard {
                    registry: self.clone(),
                    key,
                    owner: owner.to_string(),
                })
            }
        }
    }

    /// The current owner of the cluster's lock, if held.
    pub fn owner(&self, cluster: &ClusterKey) -> Option<String> {
        self.locks.lock().get(&cluster.to_string()).cloned()
    }

    fn release(&self, key: &str) {
        self.locks.lock().remove(key);
    }
}

impl ClusterGuard {
    /// The tag this lock was acquired with.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for ClusterGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_reports_the_owner() {
        let registry = ClusterLockRegistry::new();
        let key = ClusterKey::new("ns", "cluster");

        let guard = registry.try_acquire(&key, "cluster-0").unwrap();
        assert_eq!(guard.owner(), "cluster-0");
        assert_eq!(
            registry.try_acquire(&key, "cluster-1").err(),
            Some("cluster-0".to_string())
        );

        // A different cluster is unaffected.
        let other = ClusterKey::new("ns", "other");
        let _other_guard = registry.try_acquire(&other, "other-0").unwrap();
    }

    #[test]
    fn dropping_the_guard_releases_the_lock() {
        let registry = ClusterLockRegistry::new();
        let key = ClusterKey::new("ns", "cluster");

        {
            let _guard = registry.try_acquire(&key, "cluster-0").unwrap();
            assert_eq!(registry.owner(&key), Some("cluster-0".to_string()));
        }
        assert_eq!(registry.owner(&key), None);
        registry.try_acquire(&key, "cluster-1").unwrap();
    }

    #[test]
    fn guard_release_survives_error_paths() {
        let registry = ClusterLockRegistry::new();
        let key = ClusterKey::new("ns", "cluster");

        let failing = || -> Result<(), ()> {
            let _guard = registry.try_acquire(&key, "worker").map_err(|_| ())?;
            Err(())
        };
        assert!(failing().is_err());
        assert_eq!(registry.owner(&key), None);
    }
}
