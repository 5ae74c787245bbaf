pub mod common;
pub mod info;
pub mod pbs;
pub mod slurm;
