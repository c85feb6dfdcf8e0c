use portferry_transport::TransportError;
use thiserror::Error;

/// Errors that end a single tunnel
///
/// Per-connection failures never surface here; they are logged and the
/// accept loop continues.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to bind {address}: {source}\n\nTroubleshooting:\n  • Check if another process is using this address\n  • Try using a different address or port")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote listen failed: {0}")]
    RemoteListen(#[source] TransportError),

    #[error("Listener on {address} closed by the session")]
    ListenerClosed { address: String },

    #[error("Unknown session '{session}' for tunnel {tunnel}")]
    UnknownSession { session: String, tunnel: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ForwardError::UnknownSession {
            session: "bastion".to_string(),
            tunnel: "forward local=127.0.0.1:9000 remote=10.0.0.5:80 via bastion".to_string(),
        };
        assert!(err.to_string().contains("'bastion'"));
        assert!(err.to_string().contains("127.0.0.1:9000"));

        let err = ForwardError::Bind {
            address: "127.0.0.1:9000".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("Failed to bind 127.0.0.1:9000"));

        let err = ForwardError::RemoteListen(TransportError::SessionClosed);
        assert!(err.to_string().contains("Session closed"));
    }
}
