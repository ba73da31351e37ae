//! HTTP API surface: request parsing, auth passthrough, error mapping.
//! All business decisions live in the services.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
