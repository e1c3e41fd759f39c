use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use clap::{Parser, ValueEnum};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use tunnel_mux::{
    ConnReader, CountingValve, Frame, MuxConfig, Session, Stream, StreamId, Switchboard, metrics,
};

/// Frame header: stream_id:u32 | seq:u64 | closing:u8
const HEADER_LEN: usize = 13;

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Parser, Debug)]
#[clap(
    name = "mux-loopback",
    about = "Drive a switchboard over loopback TCP connections to an echo server"
)]
struct Args {
    /// Number of physical connections
    #[clap(short, long, default_value = "4")]
    connections: usize,

    /// Number of logical streams sending concurrently
    #[clap(short, long, default_value = "8")]
    streams: u32,

    /// Frames sent per stream
    #[clap(short, long, default_value = "200")]
    frames: u64,

    /// Payload bytes per frame
    #[clap(short, long, default_value = "512")]
    payload: usize,

    /// Path to configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Print Prometheus metrics after the run
    #[clap(long)]
    metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "info")]
    log_level: String,

    /// Log format
    #[clap(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Debug, Serialize)]
struct RunResult {
    connections: usize,
    streams: u32,
    frames_sent: u64,
    frames_delivered: u64,
    bytes_transmitted: u64,
    bytes_received: u64,
    duration_secs: f64,
    frames_per_sec: f64,
    per_stream: Vec<StreamResult>,
}

#[derive(Debug, Serialize)]
struct StreamResult {
    stream_id: u32,
    frames: u64,
    bytes: u64,
}

fn encode_frame(frame: &Frame) -> Vec<u8> {
    let body_len = HEADER_LEN + frame.payload.len();
    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u32(frame.stream_id.0);
    buf.put_u64(frame.seq);
    buf.put_u8(u8::from(frame.closing));
    buf.put_slice(&frame.payload);
    buf.to_vec()
}

struct LoopbackStream {
    frames: AtomicU64,
    bytes: AtomicU64,
    delivered: Arc<watch::Sender<u64>>,
}

#[async_trait]
impl Stream for LoopbackStream {
    async fn deliver_frame(&self, frame: Frame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .fetch_add(frame.payload.len() as u64, Ordering::Relaxed);
        self.delivered.send_modify(|n| *n += 1);
    }
}

/// Plaintext length-prefixed session, standing in for the real encrypted one
struct LoopbackSession {
    streams: DashMap<StreamId, Arc<LoopbackStream>>,
    delivered: Arc<watch::Sender<u64>>,
    switchboard: Mutex<Option<Switchboard>>,
    terminal_reason: Mutex<Option<String>>,
}

impl LoopbackSession {
    fn new() -> Self {
        Self {
            streams: DashMap::new(),
            delivered: Arc::new(watch::Sender::new(0)),
            switchboard: Mutex::new(None),
            terminal_reason: Mutex::new(None),
        }
    }

    fn attach(&self, switchboard: Switchboard) {
        *self.switchboard.lock() = Some(switchboard);
    }

    fn stream_results(&self) -> Vec<StreamResult> {
        let mut results: Vec<StreamResult> = self
            .streams
            .iter()
            .map(|entry| StreamResult {
                stream_id: entry.key().0,
                frames: entry.frames.load(Ordering::Relaxed),
                bytes: entry.bytes.load(Ordering::Relaxed),
            })
            .collect();
        results.sort_by_key(|r| r.stream_id);
        results
    }
}

#[async_trait]
impl Session for LoopbackSession {
    fn id(&self) -> u32 {
        1
    }

    async fn read_from(&self, conn: &mut ConnReader, buf: &mut [u8]) -> io::Result<usize> {
        let len = conn.read_u32().await? as usize;
        if len > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds read buffer", len),
            ));
        }
        conn.read_exact(&mut buf[..len]).await?;
        Ok(len)
    }

    fn deframe(&self, bytes: &[u8]) -> Result<Frame> {
        if bytes.len() < HEADER_LEN {
            anyhow::bail!("frame too short: {} bytes", bytes.len());
        }
        let mut header = &bytes[..HEADER_LEN];
        let stream_id = header.get_u32();
        let seq = header.get_u64();
        let closing = header.get_u8() == 1;
        Ok(Frame {
            stream_id: StreamId(stream_id),
            seq,
            closing,
            payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
        })
    }

    async fn resolve_stream(&self, stream_id: StreamId, closing: bool) -> Option<Arc<dyn Stream>> {
        if closing {
            return self
                .streams
                .get(&stream_id)
                .map(|s| Arc::clone(s.value()) as Arc<dyn Stream>);
        }
        let stream = self
            .streams
            .entry(stream_id)
            .or_insert_with(|| {
                Arc::new(LoopbackStream {
                    frames: AtomicU64::new(0),
                    bytes: AtomicU64::new(0),
                    delivered: Arc::clone(&self.delivered),
                })
            })
            .value()
            .clone();
        Some(stream as Arc<dyn Stream>)
    }

    fn record_terminal_reason(&self, reason: &str) {
        *self.terminal_reason.lock() = Some(reason.to_string());
    }

    async fn close(&self) {
        // Taking the handle releases the session <-> switchboard cycle
        let switchboard = self.switchboard.lock().take();
        if let Some(switchboard) = switchboard {
            tracing::info!(
                reason = ?self.terminal_reason.lock().as_deref(),
                "Closing loopback session"
            );
            switchboard.close_all();
        }
    }
}

/// Accept connections and echo every byte back on the same connection
async fn run_echo_server(listener: TcpListener) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Echo server accept failed");
                return;
            }
        };
        tokio::spawn(async move {
            let (mut reader, mut writer) = socket.into_split();
            if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                tracing::debug!(peer = %peer, error = %e, "Echo connection ended");
            }
        });
    }
}

async fn send_stream(
    switchboard: Switchboard,
    stream_id: u32,
    frames: u64,
    payload: Bytes,
) -> Result<()> {
    for seq in 0..frames {
        let frame = Frame::new(stream_id, seq, payload.clone());
        switchboard
            .send(&encode_frame(&frame))
            .await
            .with_context(|| format!("stream {} failed to send frame {}", stream_id, seq))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.log_format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(&args.log_level)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(&args.log_level)
                .json()
                .init();
        }
    }

    let config = MuxConfig::load(args.config.clone())?;
    config.validate()?;
    if args.payload + HEADER_LEN > config.read_buffer_size {
        anyhow::bail!(
            "payload of {} bytes does not fit the {} byte read buffer",
            args.payload,
            config.read_buffer_size
        );
    }

    let prometheus_handle = metrics::setup_metrics()?;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to bind echo server")?;
    let addr = listener.local_addr()?;
    tokio::spawn(run_echo_server(listener));
    tracing::info!(addr = %addr, "Echo server listening");

    let session = Arc::new(LoopbackSession::new());
    let valve = Arc::new(CountingValve::new());
    let switchboard = Switchboard::with_config(session.clone(), valve.clone(), config);
    session.attach(switchboard.clone());

    for _ in 0..args.connections {
        let socket = TcpStream::connect(addr)
            .await
            .context("Failed to connect to echo server")?;
        socket.set_nodelay(true)?;
        switchboard.add_connection(socket);
    }

    let expected = u64::from(args.streams) * args.frames;
    let payload = Bytes::from(vec![0xa5; args.payload]);
    let start = Instant::now();

    let mut senders = Vec::new();
    for stream_id in 1..=args.streams {
        senders.push(tokio::spawn(send_stream(
            switchboard.clone(),
            stream_id,
            args.frames,
            payload.clone(),
        )));
    }
    for sender in senders {
        sender.await??;
    }

    let mut delivered = session.delivered.subscribe();
    tokio::time::timeout(Duration::from_secs(30), delivered.wait_for(|n| *n >= expected))
        .await
        .context("Timed out waiting for echoed frames")??;
    let duration = start.elapsed();

    let stats = switchboard.stats();
    for (enclave, backlog) in &stats.backlogs {
        tracing::info!(enclave = %enclave, backlog, "Connection backlog after run");
    }

    let result = RunResult {
        connections: args.connections,
        streams: args.streams,
        frames_sent: expected,
        frames_delivered: *delivered.borrow(),
        bytes_transmitted: valve.transmitted(),
        bytes_received: valve.received(),
        duration_secs: duration.as_secs_f64(),
        frames_per_sec: expected as f64 / duration.as_secs_f64(),
        per_stream: session.stream_results(),
    };

    session.close().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while switchboard.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("Connections did not drain after close")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if args.metrics {
        println!("{}", prometheus_handle.render());
    }

    Ok(())
}
