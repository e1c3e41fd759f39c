//! Decoded frames handed to the switchboard by the session's deframer

use bytes::Bytes;
use std::fmt;

/// Identifier of a logical stream multiplexed over the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A decrypted frame addressed to one logical stream
///
/// The switchboard only reads `stream_id` and `closing`; the rest is carried through to the
/// stream untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    /// Per-stream sequence number, used by the stream for reordering
    pub seq: u64,
    /// Set when the peer asks for the stream to be closed
    pub closing: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, seq: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id: StreamId(stream_id),
            seq,
            closing: false,
            payload: payload.into(),
        }
    }

    /// Frame instructing the peer to close `stream_id`
    pub fn closing(stream_id: u32, seq: u64) -> Self {
        Self {
            stream_id: StreamId(stream_id),
            seq,
            closing: true,
            payload: Bytes::new(),
        }
    }
}
