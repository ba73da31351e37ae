//! Runner registry: worker registration, heartbeat lifecycle, eligibility.

pub mod models;
pub mod registry;
pub mod repository;

pub use models::{Runner, RunnerInfo};
pub use registry::{HeartbeatConfig, RemovedRunner, RunnerRegistry, run_matches_runner};
pub use repository::RunnerRepository;
