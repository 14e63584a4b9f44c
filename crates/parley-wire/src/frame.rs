//! Stream frame types.
//!
//! Every WebSocket text message on `/stream` carries exactly one JSON-encoded
//! [`StreamFrame`]. The first frame from the client must be `hello` (new
//! connection) or `resume` (reattach with a resumption token); the server
//! answers with `welcome` followed by any replayed `data` frames.

use parley_types::envelope::Envelope;
use parley_types::error::ErrorBody;
use serde::{Deserialize, Serialize};

/// Maximum size of a single encoded frame (4 MB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// A single frame on a streaming connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Client → server: open a new connection for this agent.
    Hello {
        /// Identity of the connecting agent.
        agent_id: String,
    },
    /// Client → server: reattach to a dropped connection.
    Resume {
        resume_token: String,
        /// Highest sequence number the client has already processed.
        #[serde(default)]
        last_seq: u64,
    },
    /// Server → client: connection accepted.
    Welcome {
        connection_id: String,
        /// Token to present in a later `resume` frame.
        resume_token: String,
        /// Whether buffered messages follow.
        resumed: bool,
        /// Sequence number the next new message will carry.
        next_seq: u64,
    },
    /// Server → client: a sequenced outbound envelope.
    Data { seq: u64, envelope: Envelope },
    /// Client → server: an envelope from the peer (responses, events, requests).
    Send { envelope: Envelope },
    /// Server → client: messages in `from_seq..=to_seq` were evicted and will
    /// never be delivered.
    Gap { from_seq: u64, to_seq: u64 },
    /// Client → server: every message up to and including `seq` was processed.
    Ack { seq: u64 },
    /// Heartbeat probe; either side may send it.
    Ping { ts: i64 },
    /// Heartbeat answer echoing the probe's timestamp.
    Pong { ts: i64 },
    /// Structured error; the connection stays open unless a `close` follows.
    Error { error: ErrorBody },
    /// Server → client: the connection is being terminated.
    Close { reason: String },
}

impl StreamFrame {
    /// Short frame name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            StreamFrame::Hello { .. } => "hello",
            StreamFrame::Resume { .. } => "resume",
            StreamFrame::Welcome { .. } => "welcome",
            StreamFrame::Data { .. } => "data",
            StreamFrame::Send { .. } => "send",
            StreamFrame::Gap { .. } => "gap",
            StreamFrame::Ack { .. } => "ack",
            StreamFrame::Ping { .. } => "ping",
            StreamFrame::Pong { .. } => "pong",
            StreamFrame::Error { .. } => "error",
            StreamFrame::Close { .. } => "close",
        }
    }
}

/// Encode a frame to its JSON text form.
pub fn encode_frame(frame: &StreamFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Decode a frame from JSON text, rejecting oversized input.
pub fn decode_frame(text: &str) -> Result<StreamFrame, crate::WireError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(crate::WireError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_str(text)?)
}
