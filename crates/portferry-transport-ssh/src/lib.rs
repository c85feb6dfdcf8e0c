//! SSH transport for portferry
//!
//! Sessions are backed by [russh](https://docs.rs/russh). Forward tunnels use
//! `direct-tcpip` channels; reverse tunnels use `tcpip-forward` requests and
//! receive `forwarded-tcpip` channels from the server.
//!
//! Host keys are accepted without verification (the fingerprint is logged at
//! debug level).

pub mod config;
mod handler;
pub mod listener;
pub mod session;

pub use config::{SshConfig, DEFAULT_CONNECT_TIMEOUT};
pub use listener::SshChannelListener;
pub use session::SshSession;

use async_trait::async_trait;
use portferry_proto::ServerDescriptor;
use portferry_transport::{Session, SessionProvider, TransportResult};
use std::sync::Arc;

/// Session provider that dials servers over SSH
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

#[async_trait]
impl SessionProvider for SshConnector {
    async fn establish(&self, server: &ServerDescriptor) -> TransportResult<Arc<dyn Session>> {
        let session = SshSession::connect(server, &self.config).await?;
        Ok(Arc::new(session))
    }

    fn name(&self) -> &str {
        "SSH"
    }
}
