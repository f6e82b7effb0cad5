use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// One async mutex per instance id; holding the guard gives exclusive
/// access to that instance's traversal and state transitions.
///
/// The map itself sits behind a blocking mutex that is never held across
/// an await, so entries can be dropped from `InstanceGuard::drop`.
#[derive(Default)]
pub(crate) struct InstanceLocks {
    locks: Arc<SyncMutex<LockMap>>,
}

/// Exclusive hold on one instance. Dropping it removes the map entry when
/// no other caller is holding or waiting on the same instance.
pub(crate) struct InstanceGuard {
    instance_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<SyncMutex<LockMap>>,
}

impl InstanceLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn acquire(&self, instance_id: &str) -> InstanceGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        InstanceGuard {
            instance_id: instance_id.to_string(),
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.instance_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.instance_id);
        }
    }
}
