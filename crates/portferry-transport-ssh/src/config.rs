//! SSH transport configuration

use russh::client;
use std::time::Duration;

/// Default bound on dialing plus authenticating a server
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// SSH-specific configuration shared by every session a connector establishes
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Bound on TCP connect + handshake, and separately on authentication
    pub connect_timeout: Duration,

    /// Keep-alive interval (`None` disables keep-alives)
    pub keepalive_interval: Option<Duration>,

    /// Unanswered keep-alives before the session is considered dead
    pub keepalive_max: usize,

    /// Queue depth of inbound channels per reverse listener
    pub accept_backlog: usize,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            accept_backlog: 64,
        }
    }
}

impl SshConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Build the russh client configuration
    pub(crate) fn client_config(&self) -> client::Config {
        client::Config {
            // Tunnels may sit idle for hours; liveness is handled by keep-alives
            inactivity_timeout: None,
            keepalive_interval: self.keepalive_interval,
            keepalive_max: self.keepalive_max,
            nodelay: true,
            ..Default::default()
        }
    }
}
