//! Append-only event journal and live fan-out.

pub mod hub;
pub mod log;
pub mod repository;

pub use hub::EventHub;
pub use log::EventLog;
pub use repository::EventRepository;
