//! In-memory session for engine tests
#![allow(dead_code)]

use async_trait::async_trait;
use portferry_transport::{
    BoxedStream, ChannelListener, InboundChannel, Session, SessionMap, TransportError,
    TransportResult,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

/// Guard for anything that could hang a test
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const PIPE_CAPACITY: usize = 4096;

/// Channel opened through the session, seen from the far side
pub struct FarChannel {
    pub address: String,
    pub stream: DuplexStream,
}

pub struct MockSession {
    name: String,
    closed: AtomicBool,
    unreachable: Mutex<HashSet<String>>,
    refused: Mutex<HashSet<String>>,
    far_side: mpsc::UnboundedSender<FarChannel>,
    listeners: Mutex<HashMap<String, mpsc::Sender<InboundChannel>>>,
    accept_failures: Arc<AtomicUsize>,
}

impl MockSession {
    pub fn new(name: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<FarChannel>) {
        let (far_side, far_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            name: name.to_string(),
            closed: AtomicBool::new(false),
            unreachable: Mutex::new(HashSet::new()),
            refused: Mutex::new(HashSet::new()),
            far_side,
            listeners: Mutex::new(HashMap::new()),
            accept_failures: Arc::new(AtomicUsize::new(0)),
        });
        (session, far_rx)
    }

    /// Channel opens to `address` fail
    pub fn unreachable(&self, address: &str) {
        self.unreachable.lock().unwrap().insert(address.to_string());
    }

    /// Remote listens on `address` are rejected
    pub fn refuse(&self, address: &str) {
        self.refused.lock().unwrap().insert(address.to_string());
    }

    /// The next `count` accepts on any listener fail with an I/O error
    pub fn fail_accepts(&self, count: usize) {
        self.accept_failures.fetch_add(count, Ordering::SeqCst);
    }

    /// Accept failures not yet handed out
    pub fn pending_accept_failures(&self) -> usize {
        self.accept_failures.load(Ordering::SeqCst)
    }

    /// Open a channel from the far side into the listener bound on `address`
    pub async fn inject(&self, address: &str) -> Option<DuplexStream> {
        let tx = self.listeners.lock().unwrap().get(address).cloned()?;
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send(InboundChannel {
            stream: Box::new(near),
            origin: "203.0.113.9:51000".to_string(),
        })
        .await
        .ok()?;
        Some(far)
    }
}

struct MockListener {
    address: String,
    rx: mpsc::Receiver<InboundChannel>,
    failures: Arc<AtomicUsize>,
}

#[async_trait]
impl ChannelListener for MockListener {
    async fn accept(&mut self) -> TransportResult<Option<InboundChannel>> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::Io(std::io::Error::other("accept interrupted")));
        }
        Ok(self.rx.recv().await)
    }

    fn bound_address(&self) -> &str {
        &self.address
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

#[async_trait]
impl Session for MockSession {
    async fn open_channel(&self, address: &str) -> TransportResult<BoxedStream> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        if self.unreachable.lock().unwrap().contains(address) {
            return Err(TransportError::ChannelOpen {
                address: address.to_string(),
                reason: "connect failed".to_string(),
            });
        }

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        self.far_side
            .send(FarChannel {
                address: address.to_string(),
                stream: far,
            })
            .map_err(|_| TransportError::SessionClosed)?;
        Ok(Box::new(near))
    }

    async fn accept_channels(&self, address: &str) -> TransportResult<Box<dyn ChannelListener>> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        if self.refused.lock().unwrap().contains(address) {
            return Err(TransportError::ListenRejected {
                address: address.to_string(),
                reason: "administratively prohibited".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(16);
        self.listeners
            .lock()
            .unwrap()
            .insert(address.to_string(), tx);
        Ok(Box::new(MockListener {
            address: address.to_string(),
            rx,
            failures: self.accept_failures.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.listeners.lock().unwrap().clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub fn session_map(sessions: &[Arc<MockSession>]) -> SessionMap {
    sessions
        .iter()
        .map(|s| (s.name().to_string(), s.clone() as Arc<dyn Session>))
        .collect()
}

/// Far-side HTTP server: answers every channel with `response`
pub fn serve_http(mut far_rx: mpsc::UnboundedReceiver<FarChannel>, response: &'static [u8]) {
    tokio::spawn(async move {
        while let Some(mut channel) = far_rx.recv().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.ends_with(b"\r\n\r\n") {
                    match channel.stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = channel.stream.write_all(response).await;
                let _ = channel.stream.shutdown().await;
            });
        }
    });
}

/// Address that is currently free to bind
pub async fn free_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}
