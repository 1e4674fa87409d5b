use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::TriageError;

/// One async mutex per session id; at most one traversal holds each.
///
/// Entries are created on demand and dropped once no caller holds or waits
/// on them, so idle sessions cost nothing.
pub struct SessionLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    wait: Duration,
}

impl SessionLocks {
    /// `wait` of zero rejects a second caller immediately.
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: std::sync::Mutex::new(HashMap::new()),
            wait,
        }
    }

    pub async fn acquire(&self, session_id: &str) -> Result<OwnedMutexGuard<()>, TriageError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let busy = || TriageError::SessionBusy(session_id.to_string());
        if self.wait.is_zero() {
            lock.try_lock_owned().map_err(|_| busy())
        } else {
            tokio::time::timeout(self.wait, lock.lock_owned())
                .await
                .map_err(|_| busy())
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}
