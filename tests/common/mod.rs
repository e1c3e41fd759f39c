//! Common fixtures for switchboard integration tests

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::watch;

use tunnel_mux::{ConnReader, CountingValve, EnclaveId, Frame, Session, Stream, StreamId, Switchboard};

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

/// Stream that records what it was given
pub struct RecordingStream {
    frames: Mutex<Vec<Frame>>,
    delivered: watch::Sender<usize>,
}

impl Default for RecordingStream {
    fn default() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            delivered: watch::Sender::new(0),
        }
    }
}

impl RecordingStream {
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    pub async fn wait_for_frames(&self, count: usize) {
        let mut rx = self.delivered.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|n| *n >= count))
            .await
            .expect("frames not delivered in time")
            .expect("stream dropped");
    }
}

#[async_trait]
impl Stream for RecordingStream {
    async fn deliver_frame(&self, frame: Frame) {
        let count = {
            let mut frames = self.frames.lock();
            frames.push(frame);
            frames.len()
        };
        self.delivered.send_replace(count);
    }
}

/// Session with plaintext length-prefixed frames
///
/// Only streams registered up front can be resolved.
pub struct TestSession {
    streams: DashMap<StreamId, Arc<RecordingStream>>,
    terminal_reasons: Mutex<Vec<String>>,
    closes: watch::Sender<usize>,
}

impl Default for TestSession {
    fn default() -> Self {
        Self {
            streams: DashMap::new(),
            terminal_reasons: Mutex::new(Vec::new()),
            closes: watch::Sender::new(0),
        }
    }
}

impl TestSession {
    pub fn open_stream(&self, stream_id: u32) -> Arc<RecordingStream> {
        self.streams
            .entry(StreamId(stream_id))
            .or_default()
            .value()
            .clone()
    }

    pub fn terminal_reasons(&self) -> Vec<String> {
        self.terminal_reasons.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        *self.closes.borrow()
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.closes.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|n| *n > 0))
            .await
            .expect("session not closed in time")
            .expect("session dropped");
    }
}

#[async_trait]
impl Session for TestSession {
    fn id(&self) -> u32 {
        42
    }

    async fn read_from(&self, conn: &mut ConnReader, buf: &mut [u8]) -> io::Result<usize> {
        let len = conn.read_u32().await? as usize;
        if len > buf.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized frame"));
        }
        conn.read_exact(&mut buf[..len]).await?;
        Ok(len)
    }

    fn deframe(&self, bytes: &[u8]) -> Result<Frame> {
        anyhow::ensure!(bytes.len() >= 5, "frame too short");
        Ok(Frame {
            stream_id: StreamId(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            seq: 0,
            closing: bytes[4] == 1,
            payload: Bytes::copy_from_slice(&bytes[5..]),
        })
    }

    async fn resolve_stream(&self, stream_id: StreamId, _closing: bool) -> Option<Arc<dyn Stream>> {
        self.streams
            .get(&stream_id)
            .map(|s| Arc::clone(s.value()) as Arc<dyn Stream>)
    }

    fn record_terminal_reason(&self, reason: &str) {
        self.terminal_reasons.lock().push(reason.to_string());
    }

    async fn close(&self) {
        self.closes.send_modify(|n| *n += 1);
    }
}

pub fn setup() -> (Switchboard, Arc<TestSession>, Arc<CountingValve>) {
    let session = Arc::new(TestSession::default());
    let valve = Arc::new(CountingValve::new());
    let switchboard = Switchboard::new(session.clone(), valve.clone());
    (switchboard, session, valve)
}

pub fn connect(switchboard: &Switchboard, capacity: usize) -> (EnclaveId, DuplexStream) {
    let (local, remote) = tokio::io::duplex(capacity);
    (switchboard.add_connection(local), remote)
}

pub fn backlog(switchboard: &Switchboard, id: EnclaveId) -> Option<u64> {
    switchboard
        .stats()
        .backlogs
        .into_iter()
        .find(|(enclave, _)| *enclave == id)
        .map(|(_, backlog)| backlog)
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
