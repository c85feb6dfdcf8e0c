//! Transport session abstraction
//!
//! A [`Session`] is an authenticated, encrypted connection to a remote host that
//! can carry many independent channels. The forwarding engine only talks to
//! sessions through the traits in this crate, so any transport (SSH, or an
//! in-memory mock in tests) can back a tunnel.
//!
//! # Example
//!
//! ```no_run
//! use portferry_transport::{Session, TransportResult};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example(session: &dyn Session) -> TransportResult<()> {
//! // Forward direction: open a channel to an address reachable from the far side
//! let mut channel = session.open_channel("10.0.0.5:80").await?;
//! channel.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
//!
//! // Reverse direction: listen on the far side and take inbound channels
//! let mut listener = session.accept_channels("0.0.0.0:2222").await?;
//! while let Some(inbound) = listener.accept().await? {
//!     println!("inbound channel from {}", inbound.origin);
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use portferry_proto::{EndpointError, ServerDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Authentication failed for server {server}: {reason}")]
    AuthenticationFailed { server: String, reason: String },

    #[error("No authentication method configured for server {0}")]
    NoAuthMethod(String),

    #[error("Failed to load private key {path}: {reason}")]
    KeyError { path: String, reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] EndpointError),

    #[error("Failed to open channel to {address}: {reason}")]
    ChannelOpen { address: String, reason: String },

    #[error("Remote listen on {address} rejected: {reason}")]
    ListenRejected { address: String, reason: String },

    #[error("Session closed")]
    SessionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional byte stream
///
/// Either a plain TCP connection or a channel carved out of a session.
/// `shutdown()` closes only the write direction (half-close).
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// A channel opened by the far side of a session
pub struct InboundChannel {
    pub stream: BoxedStream,

    /// Originator reported by the far side (`host:port`)
    pub origin: String,
}

impl std::fmt::Debug for InboundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundChannel")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Listener bound on the far side of a session
#[async_trait]
pub trait ChannelListener: Send {
    /// Wait for the next inbound channel
    ///
    /// Returns `Ok(None)` once the listener is closed for good (for example
    /// because its session went away). An `Err` is a transient failure of a
    /// single accept.
    async fn accept(&mut self) -> TransportResult<Option<InboundChannel>>;

    /// The address the far side actually bound
    fn bound_address(&self) -> &str;

    /// Stop listening on the far side
    async fn close(&mut self);
}

/// An established transport session
///
/// Sessions are shared read-only between tunnels and must be safe to use
/// concurrently.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open a channel to `address` as seen from the far side
    async fn open_channel(&self, address: &str) -> TransportResult<BoxedStream>;

    /// Bind `address` on the far side and yield inbound channels
    async fn accept_channels(&self, address: &str) -> TransportResult<Box<dyn ChannelListener>>;

    /// Close the session; pending accepts on its listeners end with `None`
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Name of the server this session is connected to
    fn name(&self) -> &str;
}

/// Sessions indexed by server name
pub type SessionMap = HashMap<String, Arc<dyn Session>>;

/// Establishes sessions against named servers
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn establish(&self, server: &ServerDescriptor) -> TransportResult<Arc<dyn Session>>;

    /// Transport name for logging
    fn name(&self) -> &str;
}
