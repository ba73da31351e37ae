//! Hook engine: pre/post run interception implemented as nested agent runs.

pub mod engine;
pub mod models;
pub mod repository;

pub use engine::{HookEngine, StartHookDecision};
pub use models::{HookPoint, HookRecord};
pub use repository::HookRepository;
