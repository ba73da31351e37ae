//! Parent-resume callbacks for hierarchical agent composition.

pub mod models;
pub mod processor;
pub mod repository;
pub mod template;

pub use models::{CallbackRecord, CallbackStatus, ChildResult};
pub use processor::CallbackProcessor;
pub use repository::CallbackRepository;
pub use template::render_callback_prompt;
