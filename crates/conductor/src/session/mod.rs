//! Sessions: conversational containers, serial lanes, and the run
//! orchestration service.

pub mod lanes;
pub mod models;
pub mod repository;
pub mod service;

pub use lanes::SessionLanes;
pub use models::{ExecutionMode, Session, SessionStatus};
pub use repository::SessionRepository;
pub use service::{CreateRunParams, SessionService};
