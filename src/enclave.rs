//! Physical connections participating in a session

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Any open, bidirectional byte stream can back an enclave
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedConnection = Box<dyn Connection>;

/// Read half of a connection, owned by its demultiplexer loop
pub type ConnReader = ReadHalf<BoxedConnection>;

type ConnWriter = WriteHalf<BoxedConnection>;

/// Identity of an enclave within its switchboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnclaveId(pub u64);

impl fmt::Display for EnclaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One physical connection plus the bytes currently queued on it
///
/// The read half lives in the enclave's demultiplexer task; only the write half is kept here.
/// Writes are serialized so concurrent sends never interleave on the byte stream.
pub struct ConnEnclave {
    id: EnclaveId,
    writer: Mutex<ConnWriter>,
    pending: AtomicU64,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl fmt::Debug for ConnEnclave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnEnclave")
            .field("id", &self.id)
            .field("pending", &self.pending_bytes())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnEnclave {
    /// Wrap `conn`, returning the enclave and the read half for its demultiplexer
    pub(crate) fn new(id: EnclaveId, conn: BoxedConnection) -> (Arc<Self>, ConnReader) {
        let (reader, writer) = tokio::io::split(conn);
        let enclave = Arc::new(Self {
            id,
            writer: Mutex::new(writer),
            pending: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });
        (enclave, reader)
    }

    pub fn id(&self) -> EnclaveId {
        self.id
    }

    /// Approximate bytes queued for transmission
    pub fn pending_bytes(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn charge(&self, bytes: usize) {
        self.pending.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn discharge(&self, bytes: usize) {
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |pending| {
                Some(pending.saturating_sub(bytes as u64))
            });
    }

    /// Resolves once the enclave has been closed
    pub(crate) async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Write all of `data`, waiting behind any other writer on this connection
    ///
    /// Fails with `ConnectionAborted` if the enclave is closed while waiting or writing.
    pub(crate) async fn write_all(&self, data: &[u8]) -> io::Result<usize> {
        let mut writer = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(aborted()),
            writer = self.writer.lock() => writer,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(aborted()),
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => result.map(|()| data.len()),
        }
    }

    /// Close the connection without waiting for it
    ///
    /// Wakes the demultiplexer's pending read and any waiting writers, then shuts the write half
    /// down in the background. Outside a runtime the shutdown is skipped and the connection is
    /// released when the enclave is dropped. Only the first call has any effect; returns whether
    /// this call closed it.
    pub(crate) fn close(self: &Arc<Self>) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed.cancel();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::trace!(enclave = %self.id, "No runtime, skipping write shutdown");
            return true;
        };
        let enclave = Arc::clone(self);
        runtime.spawn(async move {
            let mut writer = enclave.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                tracing::trace!(
                    enclave = %enclave.id,
                    error = %e,
                    "Shutdown of closed connection failed"
                );
            }
        });
        true
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed locally")
}
