//! Application state shared across handlers.

use std::sync::Arc;

use crate::agent::AgentService;
use crate::auth::AuthState;
use crate::dispatch::Dispatcher;
use crate::runner::RunnerRegistry;
use crate::session::SessionService;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session/run state machine and event log access.
    pub sessions: Arc<SessionService>,
    /// Blueprint registry.
    pub agents: Arc<AgentService>,
    /// Runner registry.
    pub registry: Arc<RunnerRegistry>,
    /// Run queue and lease handout.
    pub dispatcher: Arc<Dispatcher>,
    /// Bearer-token envelope.
    pub auth: AuthState,
}
