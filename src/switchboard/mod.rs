//! Switchboard over the physical connections of one session
//!
//! Outbound bytes go to whichever connection currently has the smallest backlog; inbound bytes
//! are read by one demultiplexer task per connection and routed to their logical streams.

mod deplex;
mod dispatch;
pub mod selector;

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::{MIN_READ_BUFFER_SIZE, MuxConfig};
use crate::enclave::{BoxedConnection, ConnEnclave, Connection, EnclaveId};
use crate::metrics;
use crate::session::Session;
use crate::valve::Valve;

pub use selector::least_loaded;

/// Recorded on the session when its last connection goes away
pub const TERMINAL_REASON: &str = "no underlying connection left";

/// Handle to the connection set of one session
/// Cheap to clone (all state is behind one Arc)
#[derive(Clone)]
pub struct Switchboard {
    inner: Arc<Inner>,
}

struct Inner {
    session: Arc<dyn Session>,
    valve: Arc<dyn Valve>,
    config: MuxConfig,

    // Lock order: `enclaves` before `optimum`
    enclaves: RwLock<Vec<Arc<ConnEnclave>>>,
    optimum: RwLock<Option<Arc<ConnEnclave>>>,

    next_id: AtomicU64,
    // Set once the session has been asked to close, or is closing on its own
    session_closing: AtomicBool,
}

/// Point-in-time view of the switchboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchboardStats {
    pub connections: usize,
    pub best: Option<EnclaveId>,
    /// Backlog per connection, in insertion order
    pub backlogs: Vec<(EnclaveId, u64)>,
}

impl Switchboard {
    pub fn new(session: Arc<dyn Session>, valve: Arc<dyn Valve>) -> Self {
        Self::with_config(session, valve, MuxConfig::default())
    }

    /// Build a switchboard with explicit settings
    ///
    /// A read buffer below [`MIN_READ_BUFFER_SIZE`] is raised to it.
    pub fn with_config(
        session: Arc<dyn Session>,
        valve: Arc<dyn Valve>,
        mut config: MuxConfig,
    ) -> Self {
        if let Err(e) = config.validate() {
            tracing::warn!(
                session = session.id(),
                error = %e,
                read_buffer_size = MIN_READ_BUFFER_SIZE,
                "Invalid switchboard config, using minimum read buffer"
            );
            config.read_buffer_size = MIN_READ_BUFFER_SIZE;
        }
        Self {
            inner: Arc::new(Inner {
                session,
                valve,
                config,
                enclaves: RwLock::new(Vec::new()),
                optimum: RwLock::new(None),
                next_id: AtomicU64::new(1),
                session_closing: AtomicBool::new(false),
            }),
        }
    }

    fn session_id(&self) -> u32 {
        self.inner.session.id()
    }

    /// Add an open connection and start reading from it
    ///
    /// A fresh connection has nothing queued, so it immediately becomes the preferred one for
    /// outbound traffic until the next re-evaluation says otherwise.
    pub fn add_connection(&self, conn: impl Connection) -> EnclaveId {
        let id = EnclaveId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let conn: BoxedConnection = Box::new(conn);
        let (enclave, reader) = ConnEnclave::new(id, conn);

        let connections = {
            let mut enclaves = self.inner.enclaves.write();
            enclaves.push(Arc::clone(&enclave));
            *self.inner.optimum.write() = Some(Arc::clone(&enclave));
            enclaves.len()
        };

        tracing::info!(
            session = self.session_id(),
            enclave = %id,
            connections,
            "Connection added to switchboard"
        );
        metrics::record_connection_added(self.session_id());
        metrics::update_connection_count(self.session_id(), connections);

        let switchboard = self.clone();
        tokio::spawn(async move {
            switchboard.deplex(enclave, reader).await;
        });

        id
    }

    /// Drop an enclave from the set. Returns false if it was not a member.
    ///
    /// Does not close the connection; whoever noticed the failure does that. When the set
    /// becomes empty the session is told why and asked to close, at most once.
    pub(crate) async fn remove(&self, enclave: &Arc<ConnEnclave>) -> bool {
        let (connections, terminate) = {
            let mut enclaves = self.inner.enclaves.write();
            let Some(pos) = enclaves.iter().position(|e| e.id() == enclave.id()) else {
                return false;
            };
            enclaves.remove(pos);

            let mut optimum = self.inner.optimum.write();
            if optimum
                .as_ref()
                .is_some_and(|best| best.id() == enclave.id())
            {
                *optimum = least_loaded(None, enclaves.iter().cloned(), |e| e.pending_bytes());
            }

            let terminate =
                enclaves.is_empty() && !self.inner.session_closing.swap(true, Ordering::AcqRel);
            (enclaves.len(), terminate)
        };

        tracing::debug!(
            session = self.session_id(),
            enclave = %enclave.id(),
            connections,
            "Connection removed from switchboard"
        );
        metrics::record_connection_removed(self.session_id());
        metrics::update_connection_count(self.session_id(), connections);

        if terminate {
            tracing::info!(
                session = self.session_id(),
                "No underlying connection left, closing session"
            );
            self.inner.session.record_terminal_reason(TERMINAL_REASON);
            self.inner.session.close().await;
        }

        true
    }

    /// Close every connection
    ///
    /// Meant for the session's own teardown. Each demultiplexer loop then fails its read and
    /// removes its enclave; those removals do not ask the session to close again.
    pub fn close_all(&self) {
        self.inner.session_closing.store(true, Ordering::Release);

        let enclaves = self.inner.enclaves.read();
        for enclave in enclaves.iter() {
            enclave.close();
        }

        tracing::debug!(
            session = self.session_id(),
            connections = enclaves.len(),
            "Closing all connections"
        );
    }

    /// The connection outbound traffic currently goes to
    pub(crate) fn current_best(&self) -> Option<Arc<ConnEnclave>> {
        self.inner.optimum.read().clone()
    }

    pub fn current_best_id(&self) -> Option<EnclaveId> {
        self.inner.optimum.read().as_ref().map(|e| e.id())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.enclaves.read().len()
    }

    pub fn stats(&self) -> SwitchboardStats {
        let enclaves = self.inner.enclaves.read();
        SwitchboardStats {
            connections: enclaves.len(),
            best: self.current_best_id(),
            backlogs: enclaves
                .iter()
                .map(|e| (e.id(), e.pending_bytes()))
                .collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn enclave(&self, id: EnclaveId) -> Option<Arc<ConnEnclave>> {
        self.inner
            .enclaves
            .read()
            .iter()
            .find(|e| e.id() == id)
            .cloned()
    }
}
