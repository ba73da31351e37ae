//! Canonical protocol types for conductor coordination.
//!
//! This crate defines the message formats used across the coordinator's
//! communication boundaries:
//!
//! ```text
//! Orchestrator/UI <--[HTTP + SSE: runs, events]--> Coordinator <--[HTTP: claim, report]--> Runner(s)
//!                                                                                             |
//!                                                                                         Executor
//!                                                                                   (AI or procedural)
//! ```
//!
//! The coordinator never executes agents itself. Runners claim runs, execute
//! them through an executor, and stream canonical events back. Clients speak
//! only the canonical event protocol and do not know which executor ran.
//!
//! ## Design principles
//!
//! 1. **Events are append-only.** Once sequenced into a session's log an
//!    event is never mutated; consumers resync from the durable log.
//! 2. **One canonical shape per event type.** Variant payloads are tagged
//!    unions, not free-form maps.
//! 3. **Blueprints are data.** An agent blueprint fully describes a task's
//!    contract; the resolved snapshot handed to a runner is self-contained
//!    apart from `{runner.*}` placeholders.

pub mod agent;
pub mod events;
pub mod runner;

pub use agent::{
    AgentBlueprint, AgentDemands, AgentHooks, AgentType, HookAction, HookKind, HookOnError,
    HookOutcome, HookSpec, ResolvedBlueprint, implicit_parameters_schema,
};
pub use events::{EventEnvelope, EventPayload, MessageRole};
pub use runner::{
    ClaimedRun, CompleteRunRequest, FailRunRequest, HeartbeatRequest, IngestEventsRequest,
    RegisterRunnerRequest, RegisterRunnerResponse, RunnerReport, RunnerStatus,
};
