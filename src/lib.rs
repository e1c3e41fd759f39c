//! Tunnel Mux - connection switchboard for multiplexed tunnel sessions
//!
//! Aggregates the physical connections of one session into a single virtual channel: outbound
//! bytes go to the least-loaded connection, inbound bytes are deframed by the session and routed
//! to their logical streams.

pub mod config;
pub mod enclave;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod session;
pub mod switchboard;
pub mod valve;

pub use config::MuxConfig;
pub use enclave::{Connection, ConnReader, EnclaveId};
pub use error::{MuxError, MuxResult};
pub use frame::{Frame, StreamId};
pub use session::{Session, Stream};
pub use switchboard::{Switchboard, SwitchboardStats, TERMINAL_REASON, least_loaded};
pub use valve::{CountingValve, Valve};
