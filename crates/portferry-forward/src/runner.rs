//! Tunnel runner
//!
//! A runner owns one tunnel: it binds the listening side (a local
//! `TcpListener` for forward tunnels, a far-side listener for reverse ones),
//! accepts connections, and relays each one to the target address on its own
//! task. It never restarts itself.

use crate::error::ForwardError;
use crate::relay::relay;
use portferry_proto::{Direction, TunnelSpec};
use portferry_transport::{BoxedStream, InboundChannel, Session};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pause after a failed accept so a persistent error (EMFILE) doesn't spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bound on dialing the local target of a reverse tunnel
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a runner, published through a watch channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    Listening { address: String },
    Stopped,
}

/// Connection IDs for log correlation
#[derive(Clone)]
pub struct ConnectionIdGenerator {
    next_id: Arc<AtomicU64>,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts a connection as active until dropped
struct ActiveConnection {
    active: Arc<AtomicUsize>,
}

impl ActiveConnection {
    fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            active: active.clone(),
        }
    }

    fn remaining(&self) -> usize {
        // Includes this connection
        self.active.load(Ordering::SeqCst).saturating_sub(1)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct TunnelRunner {
    spec: Arc<TunnelSpec>,
    session: Arc<dyn Session>,
    state: watch::Sender<TunnelState>,
    shutdown: watch::Receiver<bool>,
    conn_ids: ConnectionIdGenerator,
    active: Arc<AtomicUsize>,
}

impl TunnelRunner {
    /// Create a runner; it stops once `shutdown` turns `true`
    pub fn new(
        spec: TunnelSpec,
        session: Arc<dyn Session>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::Starting);
        Self {
            spec: Arc::new(spec),
            session,
            state,
            shutdown,
            conn_ids: ConnectionIdGenerator::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    /// Relays currently in flight
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run until shutdown or a fatal error
    ///
    /// Relays still in flight when this returns keep running until their
    /// streams close.
    pub async fn run(self) -> Result<(), ForwardError> {
        info!(tunnel = %self.spec, "Starting tunnel");

        let result = match self.spec.direction {
            Direction::Forward => self.run_forward().await,
            Direction::Reverse => self.run_reverse().await,
        };

        self.state.send_replace(TunnelState::Stopped);
        if result.is_ok() {
            info!(
                tunnel = %self.spec,
                active = self.active_connections(),
                "Tunnel stopped"
            );
        }
        result
    }

    async fn run_forward(&self) -> Result<(), ForwardError> {
        let listener = TcpListener::bind(self.spec.local_address.as_str())
            .await
            .map_err(|source| ForwardError::Bind {
                address: self.spec.local_address.clone(),
                source,
            })?;

        let address = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| self.spec.local_address.clone());
        info!(tunnel = %self.spec, address = %address, "Tunnel listening");
        self.state.send_replace(TunnelState::Listening { address });

        let mut shutdown = self.shutdown.clone();
        loop {
            let accepted = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => None,
                accepted = listener.accept() => Some(accepted),
            };

            match accepted {
                None => {
                    debug!(tunnel = %self.spec, "Shutdown requested, closing listener");
                    return Ok(());
                }
                Some(Ok((stream, peer_addr))) => {
                    let conn_id = self.conn_ids.generate();
                    debug!(
                        tunnel = %self.spec,
                        conn_id,
                        peer = %peer_addr,
                        "Accepted connection"
                    );

                    tokio::spawn(forward_connection(
                        self.spec.clone(),
                        self.session.clone(),
                        stream,
                        conn_id,
                        ActiveConnection::new(&self.active),
                    ));
                }
                Some(Err(e)) => {
                    warn!(tunnel = %self.spec, error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn run_reverse(&self) -> Result<(), ForwardError> {
        let mut listener = self
            .session
            .accept_channels(&self.spec.remote_address)
            .await
            .map_err(ForwardError::RemoteListen)?;

        let address = listener.bound_address().to_string();
        info!(tunnel = %self.spec, address = %address, "Tunnel listening");
        self.state.send_replace(TunnelState::Listening {
            address: address.clone(),
        });

        let mut shutdown = self.shutdown.clone();
        loop {
            let accepted = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => None,
                accepted = listener.accept() => Some(accepted),
            };

            match accepted {
                None => {
                    debug!(tunnel = %self.spec, "Shutdown requested, closing listener");
                    listener.close().await;
                    return Ok(());
                }
                Some(Ok(Some(inbound))) => {
                    let conn_id = self.conn_ids.generate();
                    debug!(
                        tunnel = %self.spec,
                        conn_id,
                        origin = %inbound.origin,
                        "Accepted channel"
                    );

                    tokio::spawn(reverse_connection(
                        self.spec.clone(),
                        inbound,
                        conn_id,
                        ActiveConnection::new(&self.active),
                    ));
                }
                Some(Ok(None)) => {
                    return Err(ForwardError::ListenerClosed { address });
                }
                Some(Err(e)) => {
                    warn!(tunnel = %self.spec, error = %e, "Failed to accept channel");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Resolves once shutdown is requested; never if the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn forward_connection(
    spec: Arc<TunnelSpec>,
    session: Arc<dyn Session>,
    mut stream: TcpStream,
    conn_id: u64,
    active: ActiveConnection,
) {
    let channel: BoxedStream = match session.open_channel(&spec.remote_address).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                tunnel = %spec,
                conn_id,
                error = %e,
                "Failed to reach remote address, dropping connection"
            );
            let _ = stream.shutdown().await;
            return;
        }
    };

    let stats = relay(stream, channel).await;
    debug!(
        tunnel = %spec,
        conn_id,
        bytes_out = stats.a_to_b,
        bytes_in = stats.b_to_a,
        active = active.remaining(),
        "Connection closed"
    );
}

async fn reverse_connection(
    spec: Arc<TunnelSpec>,
    inbound: InboundChannel,
    conn_id: u64,
    active: ActiveConnection,
) {
    let InboundChannel {
        stream: mut channel,
        origin,
    } = inbound;

    let dialed = tokio::time::timeout(
        LOCAL_DIAL_TIMEOUT,
        TcpStream::connect(spec.local_address.as_str()),
    )
    .await;

    let local = match dialed {
        Ok(Ok(local)) => local,
        Ok(Err(e)) => {
            warn!(
                tunnel = %spec,
                conn_id,
                origin = %origin,
                error = %e,
                "Failed to dial local address, dropping channel"
            );
            let _ = channel.shutdown().await;
            return;
        }
        Err(_) => {
            warn!(
                tunnel = %spec,
                conn_id,
                origin = %origin,
                "Timed out dialing local address, dropping channel"
            );
            let _ = channel.shutdown().await;
            return;
        }
    };

    let stats = relay(channel, local).await;
    debug!(
        tunnel = %spec,
        conn_id,
        bytes_in = stats.a_to_b,
        bytes_out = stats.b_to_a,
        active = active.remaining(),
        "Connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_sequential() {
        let ids = ConnectionIdGenerator::new();
        let shared = ids.clone();
        assert_eq!(ids.generate(), 1);
        assert_eq!(shared.generate(), 2);
        assert_eq!(ids.generate(), 3);
    }

    #[test]
    fn test_active_connection_guard() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = ActiveConnection::new(&active);
        let second = ActiveConnection::new(&active);
        assert_eq!(active.load(Ordering::SeqCst), 2);
        assert_eq!(second.remaining(), 1);

        drop(first);
        drop(second);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
