use std::path::PathBuf;

use thiserror::Error;

use crate::common::error::HkError::GenericError;
use crate::job::{JobId, JobState};

#[derive(Debug, Error)]
pub enum HkError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Invalid job: {0}")]
    InvalidJob(String),
    #[error("Job {id} is in state {state}")]
    InvalidState { id: JobId, state: JobState },
    #[error("Journal is used by another process (lock {0} is held)")]
    JournalLocked(PathBuf),
    #[error("Scheduler error: {0}")]
    SchedulerError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for HkError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<bincode::Error> for HkError {
    fn from(e: bincode::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for HkError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<toml::de::Error> for HkError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<String> for HkError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
