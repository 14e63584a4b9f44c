//! Core types for the parley agent-to-agent coordinator.
//!
//! This crate defines the data model shared by the negotiation engine, the
//! message router, the MCP bridge, the notification dispatcher and the
//! streaming transport. It contains no business logic and does no I/O.

pub mod agent;
pub mod capability;
pub mod config;
pub mod envelope;
pub mod error;
pub mod negotiation;
pub mod notification;
pub mod session;
pub mod tool;

pub use error::{ErrorBody, ErrorKind, ParleyError, ParleyResult};
