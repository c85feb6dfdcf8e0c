//! Reverse listener bound through `tcpip-forward`

use crate::session::SessionInner;
use async_trait::async_trait;
use portferry_proto::Endpoint;
use portferry_transport::{ChannelListener, InboundChannel, TransportResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub struct SshChannelListener {
    session: Arc<SessionInner>,
    bound: Endpoint,
    bound_display: String,
    rx: mpsc::Receiver<InboundChannel>,
    closed: bool,
}

impl SshChannelListener {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        bound: Endpoint,
        rx: mpsc::Receiver<InboundChannel>,
    ) -> Self {
        let bound_display = bound.to_string();
        Self {
            session,
            bound,
            bound_display,
            rx,
            closed: false,
        }
    }
}

#[async_trait]
impl ChannelListener for SshChannelListener {
    async fn accept(&mut self) -> TransportResult<Option<InboundChannel>> {
        Ok(self.rx.recv().await)
    }

    fn bound_address(&self) -> &str {
        &self.bound_display
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.routes.remove(u32::from(self.bound.port));
        self.rx.close();

        if let Err(e) = self
            .session
            .handle
            .shared()
            .await
            .cancel_tcpip_forward(self.bound.host.as_str(), u32::from(self.bound.port))
            .await
        {
            debug!(
                server = %self.session.name,
                address = %self.bound_display,
                error = %e,
                "cancel-tcpip-forward failed"
            );
        }
    }
}

impl Drop for SshChannelListener {
    fn drop(&mut self) {
        if !self.closed {
            self.session.routes.remove(u32::from(self.bound.port));
        }
    }
}
