//! Agent orchestration core for DeepSeek and OpenAI-compatible chat backends.
//!
//! The `core` module holds the conversation loop and its collaborators;
//! `session` wires them to a concrete backend, tool registry and tool servers.

pub mod audit;
pub mod client;
pub mod config;
pub mod core;
pub mod error_taxonomy;
pub mod llm_client;
pub mod logging;
pub mod mcp;
pub mod models;
pub mod session;
pub mod tools;
