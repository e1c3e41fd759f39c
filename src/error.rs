//! Error types returned across the switchboard boundary

use std::io;

/// Errors surfaced by [`Switchboard::send`](crate::Switchboard::send)
///
/// Receive-path failures never appear here; they are absorbed by the demultiplexer and turned
/// into membership changes.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The enclave set is empty. Retry once a connection has been added.
    #[error("no underlying connection available")]
    NoConnection,

    /// Writing to the chosen physical connection failed. The connection is presumed dead and
    /// will be dropped by its read loop.
    #[error("write to underlying connection failed: {0}")]
    Write(#[from] io::Error),
}

impl MuxError {
    /// Whether the caller may retry the same send later
    pub fn is_transient(&self) -> bool {
        matches!(self, MuxError::NoConnection)
    }
}

pub type MuxResult<T> = Result<T, MuxError>;
