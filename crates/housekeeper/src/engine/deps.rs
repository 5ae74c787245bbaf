use crate::engine::retry::RetryPolicy;
use crate::job::{DependencyKind, Job, JobId, JobState};
use crate::scheduler::DependencyMap;
use crate::store::{JobFilter, JobStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// All predecessors finished as required.
    Ready,
    /// Some predecessor has not finished yet.
    Waiting,
    /// The job can never become ready.
    Blocked(String),
}

/// Evaluates dependencies of pending jobs against the recorded predecessor states.
/// It only reads from the store.
pub struct DependencyResolver<'a> {
    store: &'a dyn JobStore,
    policy: RetryPolicy,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(store: &'a dyn JobStore) -> Self {
        Self {
            store,
            policy: RetryPolicy,
        }
    }

    /// Follows the retry chain starting at `id` and returns its newest attempt.
    pub fn latest_attempt(&self, id: JobId) -> crate::Result<Option<Job>> {
        let Some(mut job) = self.store.get(id)? else {
            return Ok(None);
        };
        while let Some(next) = self.store.list(&JobFilter::children_of(job.id))?.pop() {
            job = next;
        }
        Ok(Some(job))
    }

    pub fn ready(&self, job: &Job) -> crate::Result<bool> {
        Ok(self.readiness(job)? == Readiness::Ready)
    }

    pub fn readiness(&self, job: &Job) -> crate::Result<Readiness> {
        let mut waiting = false;
        for (kind, predecessor) in job.dependencies.edges() {
            let Some(latest) = self.latest_attempt(predecessor)? else {
                return Ok(Readiness::Blocked(format!(
                    "predecessor {predecessor} does not exist"
                )));
            };
            if !latest.is_terminal() || self.policy.retries_automatically(&latest) {
                waiting = true;
                continue;
            }
            let satisfied = match kind {
                DependencyKind::AfterSuccess => latest.state == JobState::Completed,
                DependencyKind::AfterFailure => latest.state == JobState::Failed,
                DependencyKind::AfterAny => latest.state != JobState::Unknown,
            };
            if !satisfied {
                return Ok(Readiness::Blocked(format!(
                    "{kind} dependency on job {predecessor} cannot be satisfied, it ended as {}",
                    latest.state
                )));
            }
        }
        Ok(if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        })
    }

    /// Scheduler handles of the (latest attempts of the) predecessors.
    /// Predecessors that were never submitted are left out.
    pub fn scheduler_dependencies(&self, job: &Job) -> crate::Result<DependencyMap> {
        let mut map = DependencyMap::new();
        for (kind, predecessor) in job.dependencies.edges() {
            let handle = self
                .latest_attempt(predecessor)?
                .and_then(|latest| latest.scheduler_handle);
            if let Some(handle) = handle {
                map.entry(kind).or_default().push(handle);
            }
        }
        Ok(map)
    }

    /// Jobs that depend on `job` or on any of its previous attempts.
    pub fn dependents_of_chain(&self, job: &Job) -> crate::Result<Vec<JobId>> {
        let mut dependents = self.store.dependents_of(job.id)?;
        let mut parent = job.parent;
        while let Some(id) = parent {
            dependents.extend(self.store.dependents_of(id)?);
            parent = self.store.get(id)?.and_then(|job| job.parent);
        }
        dependents.sort();
        dependents.dedup();
        Ok(dependents)
    }
}

#[cfg(test)]
mod tests {
    use super::{DependencyResolver, Readiness};
    use crate::job::{Dependencies, DependencyKind, Job, JobId, JobSpec, JobState};
    use crate::store::{JobStore, JobUpdate, MemoryJobStore};
    use std::path::PathBuf;

    fn add(store: &MemoryJobStore, dependencies: Dependencies, max_retries: u32) -> Job {
        let id = store.allocate_id().unwrap();
        let job = Job::new(
            id,
            JobSpec {
                command: "true".to_string(),
                dependencies,
                max_retries,
                ..Default::default()
            },
            PathBuf::from("/tmp"),
            chrono::Utc::now(),
        );
        store.create(job.clone()).unwrap();
        job
    }

    fn set_state(store: &MemoryJobStore, id: JobId, state: JobState) {
        store.update(id, JobUpdate::state(state)).unwrap();
    }

    fn after(kind: DependencyKind, ids: &[JobId]) -> Dependencies {
        let mut deps = Dependencies::default();
        match kind {
            DependencyKind::AfterSuccess => deps.after_success = ids.to_vec(),
            DependencyKind::AfterFailure => deps.after_failure = ids.to_vec(),
            DependencyKind::AfterAny => deps.after_any = ids.to_vec(),
        }
        deps
    }

    #[test]
    fn test_no_dependencies_is_ready() {
        let store = MemoryJobStore::default();
        let job = add(&store, Default::default(), 0);
        let resolver = DependencyResolver::new(&store);
        assert!(resolver.ready(&job).unwrap());
    }

    #[test]
    fn test_after_success() {
        let store = MemoryJobStore::default();
        let x = add(&store, Default::default(), 0);
        let y = add(&store, after(DependencyKind::AfterSuccess, &[x.id]), 0);
        let resolver = DependencyResolver::new(&store);

        assert_eq!(resolver.readiness(&y).unwrap(), Readiness::Waiting);
        set_state(&store, x.id, JobState::Running);
        assert_eq!(resolver.readiness(&y).unwrap(), Readiness::Waiting);
        set_state(&store, x.id, JobState::Completed);
        assert_eq!(resolver.readiness(&y).unwrap(), Readiness::Ready);
        set_state(&store, x.id, JobState::Failed);
        assert!(matches!(
            resolver.readiness(&y).unwrap(),
            Readiness::Blocked(_)
        ));
    }

    #[test]
    fn test_after_failure_and_any() {
        let store = MemoryJobStore::default();
        let x = add(&store, Default::default(), 0);
        let on_failure = add(&store, after(DependencyKind::AfterFailure, &[x.id]), 0);
        let on_any = add(&store, after(DependencyKind::AfterAny, &[x.id]), 0);
        let resolver = DependencyResolver::new(&store);

        set_state(&store, x.id, JobState::Failed);
        assert!(resolver.ready(&on_failure).unwrap());
        assert!(resolver.ready(&on_any).unwrap());

        for state in [JobState::Completed, JobState::Cancelled, JobState::TimedOut] {
            set_state(&store, x.id, state);
            assert!(!resolver.ready(&on_failure).unwrap());
            assert!(resolver.ready(&on_any).unwrap());
        }

        set_state(&store, x.id, JobState::Unknown);
        assert!(matches!(
            resolver.readiness(&on_any).unwrap(),
            Readiness::Blocked(_)
        ));
    }

    #[test]
    fn test_mixed_dependencies() {
        let store = MemoryJobStore::default();
        let a = add(&store, Default::default(), 0);
        let b = add(&store, Default::default(), 0);
        let job = add(
            &store,
            Dependencies {
                after_success: vec![a.id],
                after_any: vec![b.id],
                ..Default::default()
            },
            0,
        );
        let resolver = DependencyResolver::new(&store);
        set_state(&store, a.id, JobState::Completed);
        assert_eq!(resolver.readiness(&job).unwrap(), Readiness::Waiting);
        set_state(&store, b.id, JobState::Cancelled);
        assert_eq!(resolver.readiness(&job).unwrap(), Readiness::Ready);
    }

    #[test]
    fn test_missing_predecessor_fails_closed() {
        let store = MemoryJobStore::default();
        let x = add(&store, Default::default(), 0);
        let y = add(&store, after(DependencyKind::AfterAny, &[x.id]), 0);
        set_state(&store, x.id, JobState::Completed);
        store.remove(x.id).unwrap();
        let resolver = DependencyResolver::new(&store);
        assert!(!resolver.ready(&y).unwrap());
    }

    #[test]
    fn test_readiness_is_idempotent() {
        let store = MemoryJobStore::default();
        let x = add(&store, Default::default(), 0);
        let y = add(&store, after(DependencyKind::AfterSuccess, &[x.id]), 0);
        let resolver = DependencyResolver::new(&store);
        for state in [JobState::Pending, JobState::Completed, JobState::Failed] {
            set_state(&store, x.id, state);
            let first = resolver.readiness(&y).unwrap();
            let second = resolver.readiness(&y).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_follows_retry_chain() {
        let store = MemoryJobStore::default();
        let x = add(&store, Default::default(), 1);
        let y = add(&store, after(DependencyKind::AfterSuccess, &[x.id]), 0);
        let resolver = DependencyResolver::new(&store);

        // Failed attempt with retry budget left: the retry is still to come
        set_state(&store, x.id, JobState::Failed);
        assert_eq!(resolver.readiness(&y).unwrap(), Readiness::Waiting);

        let x = store.get(x.id).unwrap().unwrap();
        let retry_id = store.allocate_id().unwrap();
        let retry = x.next_attempt(retry_id, PathBuf::from("/tmp"), chrono::Utc::now());
        store.create(retry).unwrap();
        assert_eq!(resolver.latest_attempt(x.id).unwrap().unwrap().id, retry_id);
        assert_eq!(resolver.readiness(&y).unwrap(), Readiness::Waiting);

        store
            .update(
                retry_id,
                JobUpdate {
                    state: Some(JobState::Completed),
                    scheduler_handle: Some("77".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(resolver.readiness(&y).unwrap(), Readiness::Ready);
        let handles = resolver.scheduler_dependencies(&y).unwrap();
        assert_eq!(
            handles.get(&DependencyKind::AfterSuccess),
            Some(&vec!["77".to_string()])
        );
        let retry = store.get(retry_id).unwrap().unwrap();
        assert_eq!(resolver.dependents_of_chain(&retry).unwrap(), vec![y.id]);
    }

    #[test]
    fn test_unsubmitted_predecessor_is_omitted() {
        let store = MemoryJobStore::default();
        let x = add(&store, Default::default(), 0);
        let z = add(&store, Default::default(), 0);
        let y = add(
            &store,
            Dependencies {
                after_any: vec![x.id, z.id],
                ..Default::default()
            },
            0,
        );
        store
            .update(
                z.id,
                JobUpdate {
                    scheduler_handle: Some("12".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let resolver = DependencyResolver::new(&store);
        let handles = resolver.scheduler_dependencies(&y).unwrap();
        assert_eq!(
            handles.get(&DependencyKind::AfterAny),
            Some(&vec!["12".to_string()])
        );
    }
}
