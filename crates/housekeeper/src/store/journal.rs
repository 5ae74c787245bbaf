use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use bincode::Options;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};
use crate::store::{JobFilter, JobStore, JobTable, JobUpdate};

const HK_JOURNAL_HEADER: &[u8] = b"hkjl0001";
const HK_JOURNAL_VERSION: u32 = 1;

#[inline]
pub(crate) fn bincode_config() -> impl Options {
    bincode::DefaultOptions::new().allow_trailing_bytes()
}

/// Single mutation of the job table.
#[derive(Serialize, Deserialize, Debug)]
pub enum JournalEvent {
    JobCreated(Box<Job>),
    JobUpdated(JobId, JobUpdate),
    JobRemoved(JobId),
}

/// Appends job table mutations to a file on disk.
pub struct JournalWriter {
    file: BufWriter<File>,
}

impl JournalWriter {
    /// Opens an existing journal for appending, or creates a new one.
    /// `valid_size` cuts off a partially written trailing event.
    pub fn create_or_append(path: &Path, valid_size: Option<u64>) -> anyhow::Result<Self> {
        let mut raw_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let position = if let Some(size) = valid_size {
            raw_file.set_len(size)?;
            size
        } else {
            raw_file.metadata()?.len()
        };

        raw_file.seek(SeekFrom::Start(position))?;
        let mut file = BufWriter::new(raw_file);

        if position == 0 {
            Self::write_header(&mut file)?;
        }

        Ok(Self { file })
    }

    fn write_header(mut file: &mut BufWriter<File>) -> anyhow::Result<()> {
        file.write_all(HK_JOURNAL_HEADER)?;
        bincode_config().serialize_into(&mut file, &HK_JOURNAL_VERSION)?;
        file.flush()?;
        Ok(())
    }

    /// Stores the event and flushes it to the file.
    pub fn store(&mut self, event: &JournalEvent) -> anyhow::Result<()> {
        bincode_config().serialize_into(&mut self.file, event)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Reads journal events in a streaming fashion.
pub struct JournalReader {
    source: BufReader<File>,
    /// Offset of the end of the last successfully read event.
    position: u64,
}

impl JournalReader {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        if header != HK_JOURNAL_HEADER {
            bail!("Invalid journal format");
        }
        let version: u32 = bincode_config()
            .deserialize_from(&mut file)
            .map_err(|error| anyhow!("Cannot load journal header: {error:?}"))?;
        if version != HK_JOURNAL_VERSION {
            bail!("Journal version {version} does not match with {HK_JOURNAL_VERSION}");
        }
        let position = file.stream_position()?;
        Ok(Self {
            source: file,
            position,
        })
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Iterator for JournalReader {
    type Item = Result<JournalEvent, bincode::Error>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        match bincode_config().deserialize_from(&mut self.source) {
            Ok(event) => {
                if let Ok(position) = self.source.stream_position() {
                    self.position = position;
                }
                Some(Ok(event))
            }
            Err(error) => match error.deref() {
                bincode::ErrorKind::Io(e)
                    if matches!(e.kind(), std::io::ErrorKind::UnexpectedEof) =>
                {
                    None
                }
                _ => Some(Err(error)),
            },
        }
    }
}

struct JournalState {
    table: JobTable,
    writer: JournalWriter,
}

/// Job store that keeps its tables in memory and records every mutation in a journal,
/// so that the state can be restored by another process.
///
/// An exclusive lock on `<journal>.lock` is held for the lifetime of the store, only one
/// process at a time may work with the journal.
pub struct JournalJobStore {
    state: Mutex<JournalState>,
    _lock: File,
}

impl JournalJobStore {
    /// Opens the journal at `path`, replaying existing events.
    pub fn open(path: &Path) -> crate::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = acquire_lock(&lock_path(path))?;

        let mut table = JobTable::default();
        let mut valid_size = None;

        if path.exists() {
            let mut reader = JournalReader::open(path)?;
            let mut events = 0;
            for event in &mut reader {
                match event {
                    Ok(event) => {
                        replay(&mut table, event)?;
                        events += 1;
                    }
                    Err(error) => {
                        log::warn!(
                            "Journal {} contains an invalid event, ignoring the rest: {error}",
                            path.display()
                        );
                        break;
                    }
                }
            }
            log::debug!("Replayed {events} journal events from {}", path.display());
            valid_size = Some(reader.position());
        }

        let writer = JournalWriter::create_or_append(path, valid_size)?;
        Ok(Self {
            state: Mutex::new(JournalState { table, writer }),
            _lock: lock,
        })
    }

    fn state(&self) -> MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn acquire_lock(path: &Path) -> crate::Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.try_lock_exclusive().map_err(|error| {
        log::debug!("Cannot lock {}: {error}", path.display());
        crate::Error::JournalLocked(path.to_path_buf())
    })?;
    Ok(file)
}

fn replay(table: &mut JobTable, event: JournalEvent) -> crate::Result<()> {
    match event {
        JournalEvent::JobCreated(job) => table.insert(*job),
        JournalEvent::JobUpdated(id, update) => table.update(id, &update).map(|_| ()),
        JournalEvent::JobRemoved(id) => {
            table.remove(id);
            Ok(())
        }
    }
}

impl JobStore for JournalJobStore {
    fn allocate_id(&self) -> crate::Result<JobId> {
        Ok(self.state().table.allocate_id())
    }

    fn create(&self, job: Job) -> crate::Result<()> {
        let mut state = self.state();
        let event = JournalEvent::JobCreated(Box::new(job.clone()));
        state.table.insert(job)?;
        state.writer.store(&event)?;
        Ok(())
    }

    fn get(&self, id: JobId) -> crate::Result<Option<Job>> {
        Ok(self.state().table.get(id).cloned())
    }

    fn update(&self, id: JobId, update: JobUpdate) -> crate::Result<Job> {
        let mut state = self.state();
        let job = state.table.update(id, &update)?;
        state.writer.store(&JournalEvent::JobUpdated(id, update))?;
        Ok(job)
    }

    fn list(&self, filter: &JobFilter) -> crate::Result<Vec<Job>> {
        Ok(self.state().table.list(filter))
    }

    fn dependents_of(&self, id: JobId) -> crate::Result<Vec<JobId>> {
        Ok(self.state().table.dependents_of(id))
    }

    fn remove(&self, id: JobId) -> crate::Result<Option<Job>> {
        let mut state = self.state();
        let job = state.table.remove(id);
        if job.is_some() {
            state.writer.store(&JournalEvent::JobRemoved(id))?;
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::{HK_JOURNAL_HEADER, JournalJobStore, JournalReader};
    use crate::Error;
    use crate::job::{Dependencies, Failure, FailureKind, Job, JobSpec, JobState};
    use crate::store::{JobFilter, JobStore, JobUpdate};
    use std::io::Write;
    use tempfile::TempDir;

    fn job(store: &JournalJobStore, dependencies: Dependencies) -> Job {
        let id = store.allocate_id().unwrap();
        Job::new(
            id,
            JobSpec {
                command: "./run.sh".to_string(),
                dependencies,
                ..Default::default()
            },
            std::env::temp_dir().join(id.to_string()),
            chrono::Utc::now(),
        )
    }

    #[test]
    fn test_reopen_restores_state() {
        let tmpdir = TempDir::with_prefix("hk").unwrap();
        let path = tmpdir.path().join("jobs.journal");

        let (a, b) = {
            let store = JournalJobStore::open(&path).unwrap();
            let a = job(&store, Default::default());
            let a_id = a.id;
            store.create(a).unwrap();
            let b = job(
                &store,
                Dependencies {
                    after_success: vec![a_id],
                    ..Default::default()
                },
            );
            let b_id = b.id;
            store.create(b).unwrap();
            store
                .update(
                    a_id,
                    JobUpdate {
                        state: Some(JobState::Failed),
                        failure: Some(Failure::new(FailureKind::ExitCode, "exit code 2")),
                        exit_code: Some(2),
                        ..Default::default()
                    },
                )
                .unwrap();
            (a_id, b_id)
        };

        let store = JournalJobStore::open(&path).unwrap();
        let restored = store.get(a).unwrap().unwrap();
        assert_eq!(restored.state, JobState::Failed);
        assert_eq!(restored.exit_code, Some(2));
        assert_eq!(restored.failure.unwrap().kind, FailureKind::ExitCode);
        assert_eq!(store.dependents_of(a).unwrap(), vec![b]);

        // New identifiers continue after the restored ones
        assert!(store.allocate_id().unwrap() > b);
    }

    #[test]
    fn test_removal_is_persisted() {
        let tmpdir = TempDir::with_prefix("hk").unwrap();
        let path = tmpdir.path().join("jobs.journal");
        {
            let store = JournalJobStore::open(&path).unwrap();
            let a = job(&store, Default::default());
            let id = a.id;
            store.create(a).unwrap();
            store.remove(id).unwrap();
        }
        let store = JournalJobStore::open(&path).unwrap();
        assert!(store.list(&JobFilter::all()).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_event_is_ignored() {
        let tmpdir = TempDir::with_prefix("hk").unwrap();
        let path = tmpdir.path().join("jobs.journal");
        {
            let store = JournalJobStore::open(&path).unwrap();
            let a = job(&store, Default::default());
            store.create(a).unwrap();
        }
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0, 1]).unwrap();
        }
        let store = JournalJobStore::open(&path).unwrap();
        assert_eq!(store.list(&JobFilter::all()).unwrap().len(), 1);
        let b = job(&store, Default::default());
        store.create(b).unwrap();
        drop(store);

        let store = JournalJobStore::open(&path).unwrap();
        assert_eq!(store.list(&JobFilter::all()).unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_header() {
        let tmpdir = TempDir::with_prefix("hk").unwrap();
        let path = tmpdir.path().join("jobs.journal");
        std::fs::write(&path, b"garbage!").unwrap();
        assert!(JournalReader::open(&path).is_err());
        assert!(JournalJobStore::open(&path).is_err());

        std::fs::write(&path, HK_JOURNAL_HEADER).unwrap();
        assert!(JournalReader::open(&path).is_err());
    }

    #[test]
    fn test_second_store_is_rejected() {
        let tmpdir = TempDir::with_prefix("hk").unwrap();
        let path = tmpdir.path().join("jobs.journal");

        let first = JournalJobStore::open(&path).unwrap();
        let a = job(&first, Default::default());
        first.create(a).unwrap();

        assert!(matches!(
            JournalJobStore::open(&path),
            Err(Error::JournalLocked(_))
        ));

        let b = job(&first, Default::default());
        first.create(b).unwrap();
        drop(first);

        let second = JournalJobStore::open(&path).unwrap();
        let c = job(&second, Default::default());
        second.create(c).unwrap();
        drop(second);

        let store = JournalJobStore::open(&path).unwrap();
        let ids: Vec<u32> = store
            .list(&JobFilter::all())
            .unwrap()
            .iter()
            .map(|job| job.id.as_num())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
