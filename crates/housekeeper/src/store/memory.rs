use std::sync::{Mutex, MutexGuard};

use crate::job::{Job, JobId};
use crate::store::{JobFilter, JobStore, JobTable, JobUpdate};

/// Job store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryJobStore {
    table: Mutex<JobTable>,
}

impl MemoryJobStore {
    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobStore for MemoryJobStore {
    fn allocate_id(&self) -> crate::Result<JobId> {
        Ok(self.table().allocate_id())
    }

    fn create(&self, job: Job) -> crate::Result<()> {
        self.table().insert(job)
    }

    fn get(&self, id: JobId) -> crate::Result<Option<Job>> {
        Ok(self.table().get(id).cloned())
    }

    fn update(&self, id: JobId, update: JobUpdate) -> crate::Result<Job> {
        self.table().update(id, &update)
    }

    fn list(&self, filter: &JobFilter) -> crate::Result<Vec<Job>> {
        Ok(self.table().list(filter))
    }

    fn dependents_of(&self, id: JobId) -> crate::Result<Vec<JobId>> {
        Ok(self.table().dependents_of(id))
    }

    fn remove(&self, id: JobId) -> crate::Result<Option<Job>> {
        Ok(self.table().remove(id))
    }
}
