//! HTTP/WebSocket API server for the parley coordinator.
//!
//! Exposes the agent card, discovery, negotiation, messaging, notification
//! and tool endpoints over JSON, plus the `/stream` WebSocket upgrade.

pub mod error;
pub mod rate_limiter;
pub mod routes;
pub mod server;
pub mod ws;
