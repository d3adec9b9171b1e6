//! Process-wide named locks
//!
//! Device allocation, pair bookkeeping and control-process restarts each
//! span several array commands; the invariant they protect only holds if
//! the whole sequence is exclusive. Locks are keyed by purpose plus the
//! array serial (and resource group, when configured) so one host managing
//! several arrays does not serialize unrelated work.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::DriverConfig;

/// Scoped guard for a named lock; released on drop
pub type LockGuard = OwnedMutexGuard<()>;

/// Registry of named async locks
#[derive(Default)]
pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the named lock, creating it on first use
    pub async fn acquire(&self, name: &str) -> LockGuard {
        let lock = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

/// Lock names used by the driver, derived once from the configuration
#[derive(Debug, Clone)]
pub struct LockNames {
    /// Guards unused-id selection plus device creation/deletion
    pub create_ldev: String,
    /// Guards pair creation/deletion and mirror-unit bookkeeping
    pub create_pair: String,
    /// Guards restarts of each control-process instance
    pub instance: [String; 2],
}

impl LockNames {
    pub fn new(config: &DriverConfig) -> Self {
        let scope = config.lock_scope();
        Self {
            create_ldev: format!("create_ldev_{}", scope),
            create_pair: format!("create_pair_{}", scope),
            instance: [
                format!("horcmgr_{}", config.instances[0]),
                format!("horcmgr_{}", config.instances[1]),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_name_excludes() {
        let registry = LockRegistry::new();
        let guard = registry.acquire("create_ldev_492015").await;

        let registry2 = registry.clone();
        let contender = tokio::spawn(async move {
            let _guard = registry2.acquire("create_ldev_492015").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("lock was not released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_names_are_independent() {
        let registry = LockRegistry::new();
        let _guard = registry.acquire("create_ldev_492015").await;
        // Must not block on an unrelated name.
        let _other = registry.acquire("create_pair_492015").await;
    }
}
