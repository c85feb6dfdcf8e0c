//! Tunnel specification

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Returned when a direction token is neither a forward nor a reverse synonym
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tunnel direction '{token}': expected one of local, L, remote, R")]
pub struct ParseDirectionError {
    pub token: String,
}

/// Which side of the session listens for connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Listen locally, open channels to the remote address through the session
    Forward,
    /// Listen on the far side of the session, dial the local address
    Reverse,
}

impl Direction {
    /// Long configuration token for this direction
    pub fn as_token(&self) -> &'static str {
        match self {
            Direction::Forward => "local",
            Direction::Reverse => "remote",
        }
    }
}

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" | "L" => Ok(Direction::Forward),
            "remote" | "R" => Ok(Direction::Reverse),
            other => Err(ParseDirectionError {
                token: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reverse => write!(f, "reverse"),
        }
    }
}

/// One forwarding rule
///
/// Built from configuration at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Name of the session (server) the tunnel runs through
    pub session_name: String,

    /// Address on the far side of the session
    pub remote_address: String,

    /// Address on the local network
    pub local_address: String,

    pub direction: Direction,
}

impl TunnelSpec {
    pub fn new(
        session_name: impl Into<String>,
        remote_address: impl Into<String>,
        local_address: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            session_name: session_name.into(),
            remote_address: remote_address.into(),
            local_address: local_address.into(),
            direction,
        }
    }

    /// Shorthand for a forward tunnel
    pub fn forward(
        session_name: impl Into<String>,
        local_address: impl Into<String>,
        remote_address: impl Into<String>,
    ) -> Self {
        Self::new(
            session_name,
            remote_address,
            local_address,
            Direction::Forward,
        )
    }

    /// Shorthand for a reverse tunnel
    pub fn reverse(
        session_name: impl Into<String>,
        remote_address: impl Into<String>,
        local_address: impl Into<String>,
    ) -> Self {
        Self::new(
            session_name,
            remote_address,
            local_address,
            Direction::Reverse,
        )
    }

    /// The address this tunnel listens on
    pub fn listen_address(&self) -> &str {
        match self.direction {
            Direction::Forward => &self.local_address,
            Direction::Reverse => &self.remote_address,
        }
    }

    /// The address this tunnel connects to for every accepted connection
    pub fn target_address(&self) -> &str {
        match self.direction {
            Direction::Forward => &self.remote_address,
            Direction::Reverse => &self.local_address,
        }
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} local={} remote={} via {}",
            self.direction, self.local_address, self.remote_address, self.session_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_synonyms() {
        assert_eq!("local".parse::<Direction>().unwrap(), Direction::Forward);
        assert_eq!("L".parse::<Direction>().unwrap(), Direction::Forward);
        assert_eq!("remote".parse::<Direction>().unwrap(), Direction::Reverse);
        assert_eq!("R".parse::<Direction>().unwrap(), Direction::Reverse);
    }

    #[test]
    fn test_direction_unknown_token() {
        let err = "sideways".parse::<Direction>().unwrap_err();
        assert_eq!(err.token, "sideways");
        assert!(err.to_string().contains("sideways"));

        // Tokens are case sensitive
        assert!("l".parse::<Direction>().is_err());
        assert!("Local".parse::<Direction>().is_err());
    }

    #[test]
    fn test_listen_and_target_addresses() {
        let forward = TunnelSpec::forward("gw", "127.0.0.1:9000", "10.0.0.5:80");
        assert_eq!(forward.listen_address(), "127.0.0.1:9000");
        assert_eq!(forward.target_address(), "10.0.0.5:80");

        let reverse = TunnelSpec::reverse("gw", "0.0.0.0:2222", "127.0.0.1:22");
        assert_eq!(reverse.listen_address(), "0.0.0.0:2222");
        assert_eq!(reverse.target_address(), "127.0.0.1:22");
    }

    #[test]
    fn test_display_identifies_tunnel() {
        let spec = TunnelSpec::forward("gw", "127.0.0.1:9000", "10.0.0.5:80");
        assert_eq!(
            spec.to_string(),
            "forward local=127.0.0.1:9000 remote=10.0.0.5:80 via gw"
        );
    }
}
