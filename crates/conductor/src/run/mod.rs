//! Run data model and persistence.

pub mod models;
pub mod repository;

pub use models::{Run, RunStatus, RunType};
pub use repository::RunRepository;
