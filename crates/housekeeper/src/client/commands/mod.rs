pub mod job;
pub mod submit;
pub mod wait;
