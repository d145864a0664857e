pub mod agent;
pub mod arena;
pub mod control;
pub mod docker;
pub mod memory_watchdog;
pub mod runtime;
pub mod service;
pub mod supervisor;
pub mod timeout_watchdog;
pub mod workspace;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;


pub use agent::Agent;
pub use docker::DockerRuntime;
pub use runtime::ContainerRuntime;
