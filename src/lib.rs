//! Financial Assistant Orchestrator
//!
//! Drives a conversation between a user, a generative model and a set of
//! deterministic finance tools:
//! - Keeps an append-only transcript where every tool call has exactly one result
//! - Executes requested tools concurrently with per-call timeouts
//! - Bounds tool rounds per message so a looping model cannot spin forever
//! - Streams model text to observers without feeding it back until confirmed
//! - Supports cancellation of in-flight model calls and tools
//!
//! LOOP:
//! USER INPUT → MODEL → (TOOLS → MODEL)* → FINAL ANSWER

pub mod agent;
pub mod api;
pub mod audit;
pub mod config;
pub mod conversation;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod models;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use agent::{Orchestrator, SessionEvent, SessionView};
pub use config::OrchestratorConfig;
pub use models::*;
