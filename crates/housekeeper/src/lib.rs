pub mod client;
pub mod common;
pub mod engine;
pub mod job;
pub mod scheduler;
pub mod store;
pub mod tracking;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::HkError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

pub use job::JobId;

pub const HK_VERSION: &str = env!("CARGO_PKG_VERSION");
