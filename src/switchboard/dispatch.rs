//! Outbound path

use std::io;

use super::Switchboard;
use crate::error::{MuxError, MuxResult};
use crate::metrics;

impl Switchboard {
    /// Write `data` to the least-loaded connection, returning the bytes written
    ///
    /// The connection is charged for the whole payload before the write starts, so concurrent
    /// senders see it as busier and drift elsewhere. A failed write leaves the charge in place;
    /// the connection is dead and its read loop will drop it.
    pub async fn send(&self, data: &[u8]) -> MuxResult<usize> {
        let enclave = self.current_best().ok_or(MuxError::NoConnection)?;
        if data.is_empty() {
            return Ok(0);
        }
        if enclave.is_closed() {
            return Err(MuxError::Write(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            )));
        }

        enclave.charge(data.len());
        self.schedule_reevaluation();

        let written = match enclave.write_all(data).await {
            Ok(written) => written,
            Err(e) => {
                tracing::debug!(
                    session = self.session_id(),
                    enclave = %enclave.id(),
                    error = %e,
                    "Write to connection failed"
                );
                metrics::record_send_failure(self.session_id());
                return Err(e.into());
            }
        };

        self.inner.valve.await_send_admission(written).await;
        self.inner.valve.report_transmitted(written);
        enclave.discharge(written);
        self.schedule_reevaluation();

        Ok(written)
    }
}
