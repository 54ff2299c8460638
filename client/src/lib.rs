//! Netgauge - multi-phase network measurement engine
//!
//! Measures latency, jitter, packet loss, download and upload throughput
//! against a netgauge server over one WebSocket connection, and reduces the
//! samples to a [`Report`](analysis::Report).

pub mod analysis;
pub mod config;
pub mod output;
pub mod session;
pub mod testing;
pub mod transport;

pub use analysis::{FlatReport, Report, RunStatus};
pub use config::{Config, SessionConfig};
pub use session::{ProgressEvent, ProgressObserver, Session, SessionError, SessionState};
pub use transport::{MemoryTransport, Transport, WsTransport, memory_pair};
