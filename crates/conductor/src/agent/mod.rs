//! Agent blueprint registry: storage, file materialisation, placeholder
//! resolution, and the parameter/output contract gate.

pub mod files;
pub mod repository;
pub mod resolver;
pub mod schema;
pub mod service;

pub use files::BlueprintFiles;
pub use repository::{AgentRepository, StoredBlueprint};
pub use resolver::{ResolutionInput, RuntimeVars, UnresolvedPlaceholders, resolve_blueprint};
pub use schema::ValidationErrorDetail;
pub use service::AgentService;
