//! One async mutex per tenant, created on first use.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Tenant id -> lifecycle lock.
///
/// Lookup-or-insert runs under the map shard's write lock, so two callers
/// racing on a new tenant always end up with the same mutex.
#[derive(Default)]
pub struct TenantLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held for the duration of a lifecycle transition.
pub struct TenantGuard {
    lock: Arc<Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, tenant_id: &str) -> TenantGuard {
        let lock = self.lock_for(tenant_id);
        let guard = Arc::clone(&lock).lock_owned().await;
        TenantGuard {
            lock,
            _guard: guard,
        }
    }

    /// Release `guard` and drop the tenant's entry if nobody else holds or
    /// waits on it. A waiter keeps the entry alive, so it can never end up
    /// on a different mutex than a later caller.
    pub fn release(&self, tenant_id: &str, guard: TenantGuard) {
        let TenantGuard { lock, _guard } = guard;
        drop(_guard);
        // map + `lock` are the only two references when the lock is unused
        self.locks
            .remove_if(tenant_id, |_, existing| {
                Arc::ptr_eq(existing, &lock) && Arc::strong_count(existing) == 2
            });
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_tenant_same_lock() {
        let locks = TenantLocks::new();
        let a = locks.lock_for("t1");
        let b = locks.lock_for("t1");
        let c = locks.lock_for("t2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn release_drops_unused_entry() {
        let locks = TenantLocks::new();
        let guard = locks.acquire("t1").await;
        locks.release("t1", guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn release_keeps_entry_while_someone_waits() {
        let locks = Arc::new(TenantLocks::new());
        let guard = locks.acquire("t1").await;

        let waiter_locks = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let g = waiter_locks.acquire("t1").await;
            waiter_locks.release("t1", g);
        });
        // let the waiter clone the lock and park on it
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        locks.release("t1", guard);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
