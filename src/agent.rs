//! Client side of the `opencode` agent server: wire types, HTTP client, and
//! the per-directory process supervisor.

pub mod client;
pub mod supervisor;
pub mod types;

pub use client::AgentClient;
pub use supervisor::AgentPool;
