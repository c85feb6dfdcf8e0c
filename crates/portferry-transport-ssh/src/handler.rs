//! russh client callbacks and reverse-forward routing

use portferry_transport::InboundChannel;
use russh::client::{self, Msg};
use russh::keys::ssh_key::HashAlg;
use russh::Channel;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bound port on the far side → queue of the listener that requested it
#[derive(Clone, Default)]
pub(crate) struct ForwardRoutes {
    inner: Arc<Mutex<HashMap<u32, mpsc::Sender<InboundChannel>>>>,
}

impl ForwardRoutes {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, mpsc::Sender<InboundChannel>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `port` for one listener; `false` if another listener holds it
    pub(crate) fn try_insert(&self, port: u32, tx: mpsc::Sender<InboundChannel>) -> bool {
        match self.lock().entry(port) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(tx);
                true
            }
        }
    }

    /// Drop the route for `port` only if it still leads to `tx`
    pub(crate) fn remove_sender(&self, port: u32, tx: &mpsc::Sender<InboundChannel>) {
        let mut routes = self.lock();
        if routes.get(&port).is_some_and(|current| current.same_channel(tx)) {
            routes.remove(&port);
        }
    }

    pub(crate) fn remove(&self, port: u32) {
        self.lock().remove(&port);
    }

    pub(crate) fn get(&self, port: u32) -> Option<mpsc::Sender<InboundChannel>> {
        self.lock().get(&port).cloned()
    }

    /// Drop every route; listeners waiting on them see end-of-stream
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Client handler owned by the russh session task
pub(crate) struct SessionHandler {
    server: String,
    routes: ForwardRoutes,
}

impl SessionHandler {
    pub(crate) fn new(server: String, routes: ForwardRoutes) -> Self {
        Self { server, routes }
    }
}

impl client::Handler for SessionHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // No host identity policy: accept and record what we saw
        debug!(
            server = %self.server,
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "Accepting server host key"
        );
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let origin = format!("{}:{}", originator_address, originator_port);

        let Some(tx) = self.routes.get(connected_port) else {
            warn!(
                server = %self.server,
                address = %connected_address,
                port = connected_port,
                "Forwarded channel for a port nobody listens on, closing"
            );
            let _ = channel.close().await;
            return Ok(());
        };

        debug!(
            server = %self.server,
            port = connected_port,
            origin = %origin,
            "Inbound forwarded channel"
        );

        // Never await the listener here: this runs on the session task
        let inbound = InboundChannel {
            stream: Box::new(channel.into_stream()),
            origin,
        };
        if let Err(e) = tx.try_send(inbound) {
            warn!(
                server = %self.server,
                port = connected_port,
                "Reverse listener not keeping up, dropping inbound channel"
            );
            let mut inbound = e.into_inner();
            let _ = inbound.stream.shutdown().await;
        }

        Ok(())
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        // The connection is gone; end every reverse listener
        self.routes.clear();
    }
}
