//! Tunnel forwarding engine
//!
//! - [`relay`]: moves bytes between two duplex streams with half-close
//! - [`runner`]: one tunnel's accept loop, in either direction
//! - [`forwarder`]: resolves tunnels to sessions and supervises the runners
//!
//! The engine only sees sessions through `portferry_transport::Session`, so
//! it runs the same over SSH or over an in-memory mock.

pub mod error;
pub mod forwarder;
pub mod relay;
pub mod runner;

pub use error::ForwardError;
pub use forwarder::{ForwardReport, Forwarder, ForwarderHandle, SkippedTunnel, TunnelHandle};
pub use relay::{relay, RelayStats, RELAY_BUFFER_SIZE};
pub use runner::{ConnectionIdGenerator, TunnelRunner, TunnelState};
