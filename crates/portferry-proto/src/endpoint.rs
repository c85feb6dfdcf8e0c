//! `host:port` address parsing

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("address is empty")]
    Empty,

    #[error("address '{0}' has no port")]
    MissingPort(String),

    #[error("address '{address}' has an invalid port '{port}'")]
    InvalidPort { address: String, port: String },
}

/// A host and port pair
///
/// The host is kept as written (hostname or IP literal) since it may only be
/// resolvable on the far side of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Empty);
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            // [v6]:port
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
            (host, port)
        } else {
            s.rsplit_once(':')
                .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?
        };

        if port.is_empty() {
            return Err(EndpointError::MissingPort(s.to_string()));
        }

        let port = port.parse::<u16>().map_err(|_| EndpointError::InvalidPort {
            address: s.to_string(),
            port: port.to_string(),
        })?;

        Ok(Endpoint::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
