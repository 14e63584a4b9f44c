//! Parley streaming transport: long-lived agent-to-agent connections.
//!
//! Provides the `/stream` half of the coordinator: framed JSON messages over
//! a WebSocket, periodic heartbeats, bounded replay buffers and signed
//! resumption tokens so a dropped peer can reattach without losing
//! unacknowledged traffic.
//!
//! ## Architecture
//!
//! - **StreamFrame**: JSON frames exchanged on the socket
//! - **OutboundBuffer**: sequenced ring of unacknowledged outbound envelopes
//! - **ConnectionRegistry**: one connection per `(agent, session)`
//! - **StreamingTransport**: attach/resume/send/heartbeat logic
//! - **SessionGate**: trait through which the kernel validates sessions and
//!   receives inbound envelopes

pub mod buffer;
pub mod frame;
pub mod registry;
pub mod transport;

pub use frame::{decode_frame, encode_frame, StreamFrame};
pub use registry::{Connection, ConnectionKey, ConnectionRegistry, LinkState, StreamStats};
pub use transport::{
    Attachment, Delivery, SessionGate, StreamingTransport, TransportConfig, WireError,
};
