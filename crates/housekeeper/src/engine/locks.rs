use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::Map;
use crate::job::JobId;

/// One asynchronous lock per job record. All read-modify-write sequences over a single job
/// (submission, status update, cancellation) hold its lock, so updates of one job are
/// serialized while different jobs proceed independently.
#[derive(Default)]
pub struct JobLocks {
    locks: Mutex<Map<JobId, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobLocks {
    pub async fn lock(&self, id: JobId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn forget(&self, id: JobId) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}
