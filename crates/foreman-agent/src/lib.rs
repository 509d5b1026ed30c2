//! Backend abstractions for agent execution.
//!
//! A [`Backend`] is a named external execution capability (an agent-driving
//! CLI process) that the orchestrator invokes by name. Backends hand out
//! [`AgentSession`]s bound to one task and one isolated workspace; a session
//! runs a prompt to a terminal [`RunResult`] and exposes a stream of
//! [`AgentEvent`]s for observability.
//!
//! Backends are constructed through the injectable [`BackendRegistry`]
//! rather than a process-global table, so tests can substitute fakes
//! deterministically.
//!
//! # Main types
//!
//! - [`Backend`] / [`AgentSession`] — The boundary the orchestrator consumes.
//! - [`BackendRegistry`] — Name → factory map with the built-in backends.
//! - [`RunResult`] / [`AgentEvent`] — Terminal result and progress stream.
//! - [`is_quota_error`] — The quota-exhaustion signal classifier.

/// The backend/session trait boundary and its data types.
pub mod backend;
/// Claude CLI backend shim.
pub mod claude;
/// Codex CLI backend shim (streaming JSON output).
pub mod codex;
/// Gemini CLI backend shim (streaming JSON output).
pub mod gemini;
/// Deterministic in-process backend for tests and dry runs.
pub mod mock;
/// Injectable backend factory registry.
pub mod registry;
/// Quota-exhaustion signal classification.
pub mod signal;

pub use backend::{AgentEvent, AgentSession, Backend, RunResult};
pub use claude::ClaudeBackend;
pub use codex::CodexBackend;
pub use gemini::GeminiBackend;
pub use mock::MockBackend;
pub use registry::{BackendRegistry, BackendSettings};
pub use signal::is_quota_error;
