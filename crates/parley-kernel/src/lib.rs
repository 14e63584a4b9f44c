//! Core coordinator for parley.
//!
//! The [`Coordinator`](coordinator::Coordinator) ties together the agent
//! card registry, discovery, session negotiation, message routing, the MCP
//! tool bridge, push notifications and the streaming transport.

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod mcp;
pub mod negotiation;
pub mod notify;
pub mod registry;
pub mod retry;
pub mod router;
pub mod supervisor;

pub use coordinator::{Coordinator, CoordinatorHealth};
pub use error::{KernelError, KernelResult};
