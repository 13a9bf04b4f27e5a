use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per cluster namespace. Mon reconciles and health ticks of the same cluster
/// hold it for their whole duration.
#[derive(Clone, Default)]
pub struct OrchestrationLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl OrchestrationLocks {
    pub fn get(&self, namespace: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, namespace: &str) -> OwnedMutexGuard<()> {
        self.get(namespace).lock_owned().await
    }

    /// Drops the lock of a deleted cluster
    pub fn remove(&self, namespace: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(namespace);
    }
}
