//! Connection wire protocol: frame types, version, application protocol tags.

use serde::{Deserialize, Serialize};

/// Current connection protocol version. Checked in the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Line chat: one message per line, answered with [`crate::chat::CHAT_ACK`].
pub const CHAT_PROTOCOL: &str = "/chat/1.0.0";
/// Single file request/response, see [`crate::transfer`].
pub const FILE_SHARE_PROTOCOL: &str = "/fileshare/1.0.0";
/// One greeting line, then close.
pub const HELLO_PROTOCOL: &str = "/hello/1.0.0";

/// Stream identifier, unique per connection. Dialer allocates odd, listener even.
pub type StreamId = u32;

/// All frames exchanged on an established connection. Encoding is bincode;
/// each frame travels as one sealed record (see the wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Ask the remote to run its handler for `protocol` on a new stream.
    Open { stream: StreamId, protocol: String },
    /// Remote has a handler for the protocol; data may flow.
    Accept { stream: StreamId },
    /// Remote has no handler for the protocol.
    Reject { stream: StreamId, reason: String },
    /// Stream payload, in order.
    Data { stream: StreamId, payload: Vec<u8> },
    /// Sender finished writing; the remote reads end-of-stream.
    Close { stream: StreamId },
    /// Sender aborted the stream; the remote reads an error.
    Reset { stream: StreamId },
}
