pub mod config;
pub mod merge;
pub mod protocol;
pub mod sync;
pub mod task;
pub mod types;
