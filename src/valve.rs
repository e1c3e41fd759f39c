//! Traffic accounting collaborator

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Accounting and throttling hooks called on every send and receive
///
/// The switchboard reports volumes and waits for admission; how traffic is counted or limited
/// is entirely up to the implementation.
#[async_trait]
pub trait Valve: Send + Sync {
    fn report_transmitted(&self, bytes: usize);

    fn report_received(&self, bytes: usize);

    /// Block until `bytes` of outbound traffic may proceed
    async fn await_send_admission(&self, bytes: usize);

    /// Block until `bytes` of inbound traffic may proceed
    async fn await_receive_admission(&self, bytes: usize);
}

/// Valve that counts traffic and never throttles
#[derive(Debug, Default)]
pub struct CountingValve {
    tx: AtomicU64,
    rx: AtomicU64,
}

impl CountingValve {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes reported as transmitted
    pub fn transmitted(&self) -> u64 {
        self.tx.load(Ordering::Relaxed)
    }

    /// Total bytes reported as received
    pub fn received(&self) -> u64 {
        self.rx.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Valve for CountingValve {
    fn report_transmitted(&self, bytes: usize) {
        self.tx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn report_received(&self, bytes: usize) {
        self.rx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    async fn await_send_admission(&self, _bytes: usize) {}

    async fn await_receive_admission(&self, _bytes: usize) {}
}
