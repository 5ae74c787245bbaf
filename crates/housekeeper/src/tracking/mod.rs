//! Classification of finished jobs: error evidence in logs and the overall failure verdict.

pub mod failure;
pub mod logs;
