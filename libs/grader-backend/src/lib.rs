pub mod backend;
pub mod client;
pub mod local;
pub mod manager;
pub mod manual;
pub mod pool;
pub mod queue;
pub mod submit;
pub mod syncer;

#[cfg(test)]
mod test_support;

pub use backend::{from_config, ExecutionBackend};
pub use client::{AgentClient, AgentError};
pub use manager::{JobHandle, JobManager};
pub use submit::{BufferedSubmitter, SyncSubmitter};
