//! SSH session implementation

use crate::config::SshConfig;
use crate::handler::{ForwardRoutes, SessionHandler};
use crate::listener::SshChannelListener;
use async_trait::async_trait;
use portferry_proto::{Endpoint, ServerDescriptor};
use portferry_transport::{
    BoxedStream, ChannelListener, Session, TransportError, TransportResult,
};
use russh::client::{self, Handle};
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use russh::Disconnect;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Originator reported on `direct-tcpip` requests
const ORIGINATOR_ADDRESS: &str = "127.0.0.1";

/// Access to the russh handle shared by every runner on a session
///
/// Requests that only need `&Handle` (channel opens, forward cancels,
/// disconnect) share the lock and run concurrently, so a slow open never
/// blocks another tunnel. Only `tcpip-forward`, which waits on the handle's
/// reply queue, takes it exclusively.
pub(crate) struct HandleLock<H> {
    inner: RwLock<H>,
}

impl<H> HandleLock<H> {
    pub(crate) fn new(handle: H) -> Self {
        Self {
            inner: RwLock::new(handle),
        }
    }

    pub(crate) async fn shared(&self) -> RwLockReadGuard<'_, H> {
        self.inner.read().await
    }

    pub(crate) async fn exclusive(&self) -> RwLockWriteGuard<'_, H> {
        self.inner.write().await
    }

    /// `None` while an exclusive request is in flight
    pub(crate) fn try_shared(&self) -> Option<RwLockReadGuard<'_, H>> {
        self.inner.try_read().ok()
    }
}

/// State shared between a session and its reverse listeners
pub(crate) struct SessionInner {
    pub(crate) name: String,
    pub(crate) handle: HandleLock<Handle<SessionHandler>>,
    pub(crate) routes: ForwardRoutes,
    closed: AtomicBool,
}

/// An authenticated SSH session to one named server
pub struct SshSession {
    inner: Arc<SessionInner>,
    accept_backlog: usize,
}

impl SshSession {
    /// Dial and authenticate against `server`
    ///
    /// Credentials are checked (and the key file decoded) before any network
    /// I/O, so a misconfigured server fails fast.
    pub async fn connect(server: &ServerDescriptor, config: &SshConfig) -> TransportResult<Self> {
        let credentials = &server.credentials;
        if credentials.is_empty() {
            return Err(TransportError::NoAuthMethod(server.name.clone()));
        }

        let key = match &credentials.key_file {
            Some(path) => Some(
                load_secret_key(path, credentials.key_passphrase.as_deref()).map_err(|e| {
                    TransportError::KeyError {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?,
            ),
            None => None,
        };

        info!(
            server = %server.name,
            address = %server.address(),
            user = %server.user,
            "Connecting to SSH server"
        );

        let routes = ForwardRoutes::default();
        let handler = SessionHandler::new(server.name.clone(), routes.clone());

        let mut handle = tokio::time::timeout(
            config.connect_timeout,
            client::connect(
                Arc::new(config.client_config()),
                (server.host.as_str(), server.port),
                handler,
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| {
            TransportError::ConnectionError(format!(
                "Failed to connect to {} ({}): {}",
                server.name,
                server.address(),
                e
            ))
        })?;

        tokio::time::timeout(
            config.connect_timeout,
            authenticate(&mut handle, server, key),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        info!(server = %server.name, user = %server.user, "SSH session established");

        Ok(Self {
            inner: Arc::new(SessionInner {
                name: server.name.clone(),
                handle: HandleLock::new(handle),
                routes,
                closed: AtomicBool::new(false),
            }),
            accept_backlog: config.accept_backlog.max(1),
        })
    }
}

/// Public key first, then password, as configured
async fn authenticate(
    handle: &mut Handle<SessionHandler>,
    server: &ServerDescriptor,
    key: Option<PrivateKey>,
) -> TransportResult<()> {
    let auth_error = |e: russh::Error| TransportError::AuthenticationFailed {
        server: server.name.clone(),
        reason: e.to_string(),
    };

    if let Some(key) = key {
        let rsa_hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(auth_error)?
            .flatten();

        let result = handle
            .authenticate_publickey(
                server.user.as_str(),
                PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
            )
            .await
            .map_err(auth_error)?;

        if result.success() {
            debug!(server = %server.name, "Public key accepted");
            return Ok(());
        }
        debug!(server = %server.name, "Public key rejected");
    }

    if let Some(password) = server
        .credentials
        .password
        .as_deref()
        .filter(|p| !p.is_empty())
    {
        let result = handle
            .authenticate_password(server.user.as_str(), password)
            .await
            .map_err(auth_error)?;

        if result.success() {
            debug!(server = %server.name, "Password accepted");
            return Ok(());
        }
        debug!(server = %server.name, "Password rejected");
    }

    Err(TransportError::AuthenticationFailed {
        server: server.name.clone(),
        reason: "all configured methods were rejected".to_string(),
    })
}

impl SshSession {
    async fn cancel_forward(&self, host: &str, port: u32) {
        if let Err(e) = self
            .inner
            .handle
            .shared()
            .await
            .cancel_tcpip_forward(host, port)
            .await
        {
            debug!(server = %self.inner.name, port, error = %e, "cancel-tcpip-forward failed");
        }
    }
}

#[async_trait]
impl Session for SshSession {
    async fn open_channel(&self, address: &str) -> TransportResult<BoxedStream> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let target: Endpoint = address.parse()?;

        let channel = self
            .inner
            .handle
            .shared()
            .await
            .channel_open_direct_tcpip(
                target.host.as_str(),
                u32::from(target.port),
                ORIGINATOR_ADDRESS,
                0,
            )
            .await
            .map_err(|e| TransportError::ChannelOpen {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn accept_channels(&self, address: &str) -> TransportResult<Box<dyn ChannelListener>> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let bind: Endpoint = address.parse()?;
        let requested_port = u32::from(bind.port);

        let (tx, rx) = mpsc::channel(self.accept_backlog);

        // Route before asking, the server may open channels right after replying
        if requested_port != 0 && !self.inner.routes.try_insert(requested_port, tx.clone()) {
            return Err(TransportError::ListenRejected {
                address: address.to_string(),
                reason: format!("port {} is already forwarded on this session", requested_port),
            });
        }

        let result = self
            .inner
            .handle
            .exclusive()
            .await
            .tcpip_forward(bind.host.as_str(), requested_port)
            .await;

        let bound_port = match result {
            Ok(assigned) if requested_port == 0 => {
                if !self.inner.routes.try_insert(assigned, tx) {
                    self.cancel_forward(bind.host.as_str(), assigned).await;
                    return Err(TransportError::ListenRejected {
                        address: address.to_string(),
                        reason: format!("assigned port {} is already routed", assigned),
                    });
                }
                assigned
            }
            Ok(_) => requested_port,
            Err(e) => {
                if requested_port != 0 {
                    self.inner.routes.remove_sender(requested_port, &tx);
                }
                return Err(TransportError::ListenRejected {
                    address: address.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let bound = Endpoint::new(bind.host, bound_port as u16);
        info!(
            server = %self.inner.name,
            address = %bound,
            "Remote listener established"
        );

        Ok(Box::new(SshChannelListener::new(
            self.inner.clone(),
            bound,
            rx,
        )))
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.routes.clear();

        if let Err(e) = self
            .inner
            .handle
            .shared()
            .await
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!(server = %self.inner.name, error = %e, "Error while disconnecting");
        }
        info!(server = %self.inner.name, "SSH session closed");
    }

    fn is_closed(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return true;
        }
        // Busy means a listen request is in flight, so the session is still up
        self.inner
            .handle
            .try_shared()
            .map(|handle| handle.is_closed())
            .unwrap_or(false)
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}
