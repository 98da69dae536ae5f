//! Orchestration core: stream assembly, requests, permissions, tool batches
//! and the conversation loop.

pub mod capabilities;
pub mod events;
pub mod executor;
pub mod ops;
pub mod orchestrator;
pub mod permission;
pub mod request;
pub mod stream;

pub use capabilities::{Capabilities, NoCapabilities, SessionCapabilities};
pub use events::{Event, TurnOutcomeStatus};
pub use executor::{BatchError, ToolExecutor};
pub use ops::Op;
pub use orchestrator::{ConversationOrchestrator, TurnOutcome};
pub use permission::{
    ApprovalDecision, ApprovalMode, ChannelPrompt, PermissionDecision, PermissionGate,
    PermissionPrompt,
};
pub use request::{RequestError, RequestExecutor};
pub use stream::{AssembledResponse, StreamAssembler, StreamError};
