//! Inbound path: one read loop per connection

use std::io;
use std::sync::Arc;

use super::Switchboard;
use crate::enclave::{ConnEnclave, ConnReader};
use crate::metrics;

impl Switchboard {
    /// Read from one connection until it fails, routing every frame to its stream
    ///
    /// This is the only reader of `reader`, so frames from one connection reach their streams
    /// in arrival order. Bad bytes, empty units and unknown streams are dropped; only a failed
    /// read (end of stream included) ends the loop, after which the enclave is closed and removed.
    pub(super) async fn deplex(self, enclave: Arc<ConnEnclave>, mut reader: ConnReader) {
        let session = Arc::clone(&self.inner.session);
        let mut buf = vec![0u8; self.inner.config.read_buffer_size];

        loop {
            let read = tokio::select! {
                biased;
                _ = enclave.closed() => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection closed locally",
                )),
                read = session.read_from(&mut reader, &mut buf) => read,
            };

            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    self.drop_connection(&enclave, e).await;
                    return;
                }
            };

            self.inner.valve.report_received(n);
            self.inner.valve.await_receive_admission(n).await;

            let frame = match session.deframe(&buf[..n]) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(
                        session = session.id(),
                        enclave = %enclave.id(),
                        bytes = n,
                        error = %e,
                        "Failed to deframe bytes, dropping them"
                    );
                    metrics::record_deframe_failure(session.id());
                    continue;
                }
            };

            let stream_id = frame.stream_id;
            let closing = frame.closing;
            match session.resolve_stream(stream_id, closing).await {
                Some(stream) => stream.deliver_frame(frame).await,
                // Both ends closing the same stream at once ends up here
                None => {
                    tracing::trace!(
                        session = session.id(),
                        stream = %stream_id,
                        closing,
                        "Discarding frame for unknown stream"
                    );
                    metrics::record_frame_discarded(session.id());
                }
            }
        }
    }

    async fn drop_connection(&self, enclave: &Arc<ConnEnclave>, error: io::Error) {
        tracing::trace!(
            session = self.session_id(),
            enclave = %enclave.id(),
            error = %error,
            "Connection for session has closed"
        );
        enclave.close();
        self.remove(enclave).await;
    }
}
