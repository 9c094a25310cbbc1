//! Request/response transport for overlay RPCs
//!
//! This module provides a trait-based abstraction over the wire, with a TCP
//! implementation for real deployments and an in-memory network for tests.
//! Every exchange is one length-prefixed request frame answered by one
//! length-prefixed response frame.

use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

/// Largest frame either side will accept
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A `host:port` network address
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Create a new PeerAddress without validation
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Get the address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part of the address
    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').map(|(host, _)| host).unwrap_or(&self.0)
    }

    /// Port part of the address, if it parses
    pub fn port(&self) -> Option<u16> {
        self.0.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self.0)
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let Some((host, port)) = s.rsplit_once(':') else {
            return Err(Error::InvalidAddress(format!("missing port in {:?}", s)));
        };
        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("missing host in {:?}", s)));
        }
        if port.parse::<u16>().is_err() {
            return Err(Error::InvalidAddress(format!("bad port in {:?}", s)));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<std::net::SocketAddr> for PeerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

/// Serves inbound requests
///
/// Handlers answer synchronously; they must not block on the network.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, request: &[u8]) -> Vec<u8>;
}

/// Keeps a listener alive; dropping it stops accepting connections
pub struct ListenerGuard {
    address: PeerAddress,
    task: Option<AbortHandle>,
}

impl ListenerGuard {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Transport trait for overlay RPCs
///
/// This trait abstracts over the wire, allowing for:
/// - TCP in production
/// - An in-memory network for testing
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start accepting requests on `addr` and dispatch them to `handler`
    async fn listen(&self, addr: &PeerAddress, handler: Arc<dyn MessageHandler>) -> Result<ListenerGuard>;

    /// Send one request to `peer` and wait up to `timeout` for its response
    async fn request(&self, peer: &PeerAddress, data: Vec<u8>, timeout: Duration) -> Result<Vec<u8>>;
}

/// TCP transport with u32 big-endian length prefixes
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(data.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_u32(len).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

async fn serve_connection(mut stream: TcpStream, handler: Arc<dyn MessageHandler>) -> std::io::Result<()> {
    while let Some(request) = read_frame(&mut stream).await? {
        let response = handler.handle(&request);
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, addr: &PeerAddress, handler: Arc<dyn MessageHandler>) -> Result<ListenerGuard> {
        let listener = TcpListener::bind(addr.as_str())
            .await
            .map_err(|e| Error::Startup(format!("bind {}: {}", addr, e)))?;
        let local = PeerAddress::from(listener.local_addr()?);
        tracing::info!("Overlay listening on {}", local);

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler).await {
                                tracing::debug!("Connection from {} ended: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(ListenerGuard {
            address: local,
            task: Some(task.abort_handle()),
        })
    }

    async fn request(&self, peer: &PeerAddress, data: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let exchange = async {
            let mut stream = TcpStream::connect(peer.as_str())
                .await
                .map_err(|e| Error::Network(format!("connect {}: {}", peer, e)))?;
            write_frame(&mut stream, &data)
                .await
                .map_err(|e| Error::Network(format!("send to {}: {}", peer, e)))?;
            read_frame(&mut stream)
                .await
                .map_err(|e| Error::Network(format!("receive from {}: {}", peer, e)))?
                .ok_or_else(|| Error::Network(format!("{} closed the connection", peer)))
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(format!("request to {}", peer)))?
    }
}

pub mod mock {
    //! In-memory network for testing

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
    use std::sync::Mutex;

    /// A set of in-process listeners addressed like real peers
    #[derive(Default)]
    pub struct MemoryNetwork {
        handlers: Mutex<HashMap<PeerAddress, Arc<dyn MessageHandler>>>,
        offline: Mutex<HashSet<PeerAddress>>,
        next_port: AtomicU16,
        requests: AtomicU64,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                next_port: AtomicU16::new(40000),
                ..Default::default()
            })
        }

        /// A transport attached to this network
        pub fn transport(self: &Arc<Self>) -> MemoryTransport {
            MemoryTransport {
                network: self.clone(),
            }
        }

        /// Make `addr` unreachable, as if the process had died
        pub fn take_offline(&self, addr: &PeerAddress) {
            self.offline.lock().unwrap_or_else(|e| e.into_inner()).insert(addr.clone());
        }

        /// Total requests delivered so far
        pub fn request_count(&self) -> u64 {
            self.requests.load(Ordering::SeqCst)
        }
    }

    /// Transport handle onto a [`MemoryNetwork`]
    #[derive(Clone)]
    pub struct MemoryTransport {
        network: Arc<MemoryNetwork>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn listen(&self, addr: &PeerAddress, handler: Arc<dyn MessageHandler>) -> Result<ListenerGuard> {
            let address = match addr.port() {
                Some(0) | None => {
                    let port = self.network.next_port.fetch_add(1, Ordering::SeqCst);
                    PeerAddress::new(format!("{}:{}", addr.host(), port))
                }
                Some(_) => addr.clone(),
            };

            let mut handlers = self.network.handlers.lock().unwrap_or_else(|e| e.into_inner());
            if handlers.contains_key(&address) {
                return Err(Error::Startup(format!("{} already in use", address)));
            }
            handlers.insert(address.clone(), handler);

            Ok(ListenerGuard { address, task: None })
        }

        async fn request(&self, peer: &PeerAddress, data: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>> {
            tokio::task::yield_now().await;

            if self.network.offline.lock().unwrap_or_else(|e| e.into_inner()).contains(peer) {
                return Err(Error::Network(format!("{} is offline", peer)));
            }
            let handler = self
                .network
                .handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(peer)
                .cloned()
                .ok_or_else(|| Error::Network(format!("connection refused: {}", peer)))?;

            self.network.requests.fetch_add(1, Ordering::SeqCst);
            Ok(handler.handle(&data))
        }
    }

}
