//! Session and stream collaborators consumed by the switchboard

use crate::enclave::ConnReader;
use crate::frame::{Frame, StreamId};
use anyhow::Result;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

// ============================================================================
// Trait Definitions
// ============================================================================

/// The session owning a switchboard
///
/// The switchboard never decrypts or parses anything itself; every byte read from a connection
/// goes through `read_from` and `deframe`, and every frame is routed through `resolve_stream`.
#[async_trait]
pub trait Session: Send + Sync {
    /// Session identifier, used in logs and metric labels
    fn id(&self) -> u32;

    /// Read the next unit of raw bytes from `conn` into `buf`
    ///
    /// End of stream must come back as an error (`UnexpectedEof`); `Ok(0)` is an empty unit and
    /// is handed to `deframe` like any other. The default reads whatever is available; sessions
    /// whose transport is record-oriented should read exactly one record.
    async fn read_from(&self, conn: &mut ConnReader, buf: &mut [u8]) -> io::Result<usize> {
        match conn.read(buf).await? {
            0 if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )),
            n => Ok(n),
        }
    }

    /// Decrypt and decode one unit of raw bytes
    fn deframe(&self, bytes: &[u8]) -> Result<Frame>;

    /// Look up the stream a frame is addressed to
    ///
    /// `closing` is set when the frame asks for the stream to be closed, so that an unknown or
    /// already-closed stream is not recreated just to be closed again.
    async fn resolve_stream(&self, stream_id: StreamId, closing: bool) -> Option<Arc<dyn Stream>>;

    /// Remember why the session is about to terminate
    fn record_terminal_reason(&self, reason: &str);

    /// Tear the session down
    ///
    /// Called from inside a demultiplexer loop, so it must not wait for those loops to finish.
    /// It is typically where the session calls [`Switchboard::close_all`](crate::Switchboard::close_all).
    async fn close(&self);
}

/// A logical stream receiving frames from the switchboard
#[async_trait]
pub trait Stream: Send + Sync {
    async fn deliver_frame(&self, frame: Frame);
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use bytes::{BufMut, Bytes, BytesMut};
    use dashmap::DashMap;
    use parking_lot::Mutex;
    use tokio::sync::watch;

    /// Encode a frame the way [`MockSession`] expects it on the wire:
    /// `len:u32 | stream_id:u32 | closing:u8 | payload`
    pub fn encode_frame(frame: &Frame) -> Vec<u8> {
        let body_len = 5 + frame.payload.len();
        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u32(frame.stream_id.0);
        buf.put_u8(u8::from(frame.closing));
        buf.put_slice(&frame.payload);
        buf.to_vec()
    }

    /// Stream that collects every delivered frame
    pub struct MockStream {
        frames: Mutex<Vec<Frame>>,
        delivered: watch::Sender<usize>,
    }

    impl MockStream {
        pub fn new() -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                delivered: watch::Sender::new(0),
            }
        }

        pub fn frames(&self) -> Vec<Frame> {
            self.frames.lock().clone()
        }

        /// Wait until at least `count` frames have been delivered
        pub async fn wait_for_frames(&self, count: usize) {
            let mut rx = self.delivered.subscribe();
            let _ = rx.wait_for(|n| *n >= count).await;
        }
    }

    #[async_trait]
    impl Stream for MockStream {
        async fn deliver_frame(&self, frame: Frame) {
            let count = {
                let mut frames = self.frames.lock();
                frames.push(frame);
                frames.len()
            };
            self.delivered.send_replace(count);
        }
    }

    /// Session with a length-prefixed plaintext frame layout
    ///
    /// Streams are created on demand unless the frame is a closing one.
    pub struct MockSession {
        streams: DashMap<StreamId, Arc<MockStream>>,
        terminal_reasons: Mutex<Vec<String>>,
        closes: watch::Sender<usize>,
    }

    impl Default for MockSession {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockSession {
        pub fn new() -> Self {
            Self {
                streams: DashMap::new(),
                terminal_reasons: Mutex::new(Vec::new()),
                closes: watch::Sender::new(0),
            }
        }

        /// Get or create a stream ahead of any traffic
        pub fn stream(&self, stream_id: u32) -> Arc<MockStream> {
            self.streams
                .entry(StreamId(stream_id))
                .or_insert_with(|| Arc::new(MockStream::new()))
                .value()
                .clone()
        }

        pub fn has_stream(&self, stream_id: u32) -> bool {
            self.streams.contains_key(&StreamId(stream_id))
        }

        pub fn terminal_reasons(&self) -> Vec<String> {
            self.terminal_reasons.lock().clone()
        }

        pub fn close_count(&self) -> usize {
            *self.closes.borrow()
        }

        /// Wait until the session has been asked to close at least once
        pub async fn wait_closed(&self) {
            let mut rx = self.closes.subscribe();
            let _ = rx.wait_for(|n| *n > 0).await;
        }
    }

    #[async_trait]
    impl Session for MockSession {
        fn id(&self) -> u32 {
            7
        }

        async fn read_from(&self, conn: &mut ConnReader, buf: &mut [u8]) -> io::Result<usize> {
            let len = conn.read_u32().await? as usize;
            if len > buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "frame larger than read buffer",
                ));
            }
            conn.read_exact(&mut buf[..len]).await?;
            Ok(len)
        }

        fn deframe(&self, bytes: &[u8]) -> Result<Frame> {
            if bytes.len() < 5 {
                anyhow::bail!("frame too short: {} bytes", bytes.len());
            }
            let stream_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let closing = match bytes[4] {
                0 => false,
                1 => true,
                other => anyhow::bail!("invalid closing flag {}", other),
            };
            Ok(Frame {
                stream_id: StreamId(stream_id),
                seq: 0,
                closing,
                payload: Bytes::copy_from_slice(&bytes[5..]),
            })
        }

        async fn resolve_stream(
            &self,
            stream_id: StreamId,
            closing: bool,
        ) -> Option<Arc<dyn Stream>> {
            if closing {
                return self
                    .streams
                    .get(&stream_id)
                    .map(|s| Arc::clone(s.value()) as Arc<dyn Stream>);
            }
            Some(self.stream(stream_id.0) as Arc<dyn Stream>)
        }

        fn record_terminal_reason(&self, reason: &str) {
            self.terminal_reasons.lock().push(reason.to_string());
        }

        async fn close(&self) {
            self.closes.send_modify(|n| *n += 1);
        }
    }
}
