//! Session establishment at startup

use futures::future::join_all;
use portferry_proto::ServerDescriptor;
use portferry_transport::{SessionMap, SessionProvider};
use tracing::{error, info};

/// Establish a session to every server, concurrently
///
/// A server that fails is logged and left out of the map, so every tunnel
/// that references it is skipped at dispatch. There is no retry.
pub async fn establish_all(
    provider: &dyn SessionProvider,
    servers: &[ServerDescriptor],
) -> SessionMap {
    let attempts = servers.iter().map(|server| async move {
        let result = provider.establish(server).await;
        (server, result)
    });

    let mut sessions = SessionMap::new();
    for (server, result) in join_all(attempts).await {
        match result {
            Ok(session) => {
                sessions.insert(server.name.clone(), session);
            }
            Err(e) => {
                error!(
                    server = %server.name,
                    address = %server.address(),
                    transport = provider.name(),
                    error = %e,
                    "Failed to establish session, its tunnels will be skipped"
                );
            }
        }
    }

    info!(
        established = sessions.len(),
        failed = servers.len() - sessions.len(),
        "Sessions ready"
    );
    sessions
}
