//! Replication Transport
//!
//! How bytes get between nodes. URLs select the transport:
//! - `tcp://host:port` plain TCP
//! - `mem://name` the in-process `MemoryNetwork`, for multi-node tests
//!
//! Peer authentication belongs to the transport; this module hands back an
//! already-established duplex byte stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::errors::{ReplicationError, ReplicationResult};

/// A bidirectional byte stream.
pub trait ReplicationStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ReplicationStream for T {}

pub type BoxedStream = Box<dyn ReplicationStream>;

/// Opens outgoing connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> ReplicationResult<BoxedStream>;
}

/// Yields incoming connections.
#[async_trait]
pub trait ReplicationListener: Send {
    /// Next connection and a description of the peer.
    async fn accept(&mut self) -> ReplicationResult<(BoxedStream, String)>;
}

fn tcp_address(url: &str) -> ReplicationResult<&str> {
    url.strip_prefix("tcp://")
        .map(|rest| rest.trim_end_matches('/'))
        .filter(|addr| !addr.is_empty())
        .ok_or_else(|| {
            ReplicationError::invalid_configuration(format!("'{}' is not a tcp:// url", url))
        })
}

/// Plain TCP dialer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, url: &str) -> ReplicationResult<BoxedStream> {
        let stream = TcpStream::connect(tcp_address(url)?)
            .await
            .map_err(|e| ReplicationError::transient(format!("connect to {} failed: {}", url, e)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// TCP listener for the replication port.
pub struct TcpReplicationListener {
    listener: TcpListener,
}

impl TcpReplicationListener {
    pub async fn bind(addr: &str) -> ReplicationResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ReplicationError::invalid_configuration(format!("cannot bind {}: {}", addr, e))
        })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> ReplicationResult<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl ReplicationListener for TcpReplicationListener {
    async fn accept(&mut self) -> ReplicationResult<(BoxedStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), peer.to_string()))
    }
}

const MEMORY_PIPE_BYTES: usize = 256 * 1024;

/// In-process network of named endpoints backed by `tokio::io::duplex`.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: Mutex<HashMap<String, mpsc::Sender<BoxedStream>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start accepting on `url`. Rebinding replaces the previous listener.
    pub fn bind(&self, url: &str) -> MemoryListener {
        let (tx, rx) = mpsc::channel(64);
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        endpoints.insert(url.to_ascii_lowercase(), tx);
        MemoryListener {
            url: url.to_string(),
            incoming: rx,
        }
    }

    /// Stop accepting on `url`; later dials are refused.
    pub fn unbind(&self, url: &str) {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        endpoints.remove(&url.to_ascii_lowercase());
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, url: &str) -> ReplicationResult<BoxedStream> {
        let sender = {
            let endpoints = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
            endpoints.get(&url.trim_end_matches('/').to_ascii_lowercase()).cloned()
        };
        let sender = sender.ok_or_else(|| {
            ReplicationError::transient(format!("connection to {} refused", url))
        })?;
        let (client, server) = tokio::io::duplex(MEMORY_PIPE_BYTES);
        sender
            .send(Box::new(server))
            .await
            .map_err(|_| ReplicationError::transient(format!("connection to {} refused", url)))?;
        Ok(Box::new(client))
    }
}

/// Accepting end of a `MemoryNetwork` endpoint.
pub struct MemoryListener {
    url: String,
    incoming: mpsc::Receiver<BoxedStream>,
}

#[async_trait]
impl ReplicationListener for MemoryListener {
    async fn accept(&mut self) -> ReplicationResult<(BoxedStream, String)> {
        match self.incoming.recv().await {
            Some(stream) => Ok((stream, format!("{} peer", self.url))),
            None => Err(ReplicationError::cancelled(format!(
                "listener {} was unbound",
                self.url
            ))),
        }
    }
}
