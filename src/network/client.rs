//! Network Client
//!
//! TCP client for connecting to other nodes, and the TCP implementation of
//! `PeerTransport`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{read_message, write_message, Message, MessageHandler, NetworkServer, PeerTransport};
use crate::error::{Error, Result};

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Connection pool: address -> connection
    pool: RwLock<HashMap<String, Arc<Mutex<TcpStream>>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for response
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        match timeout(self.request_timeout, self.send_inner(address, message)).await {
            Ok(inner_result) => inner_result,
            Err(_) => {
                // A reply may still be in flight on the pooled stream
                self.remove_connection(address).await;
                Err(Error::ConnectionTimeout(address.to_string()))
            }
        }
    }

    /// Send without timeout wrapper
    async fn send_inner(&self, address: &str, message: Message) -> Result<Message> {
        // Try to reuse an existing connection
        if let Some(entry) = self.get_connection(address).await {
            let mut stream = entry.lock().await;
            match round_trip(&mut stream, &message).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!("Pooled connection to {} failed, reconnecting: {}", address, e);
                    drop(stream);
                    self.remove_connection(address).await;
                }
            }
        }

        let mut stream = self.connect(address).await?;
        let response = round_trip(&mut stream, &message).await?;
        self.store_connection(address.to_string(), stream).await;
        Ok(response)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Get a connection from the pool
    async fn get_connection(&self, address: &str) -> Option<Arc<Mutex<TcpStream>>> {
        let pool = self.pool.read().await;
        pool.get(address).cloned()
    }

    /// Store a connection in the pool
    async fn store_connection(&self, address: String, stream: TcpStream) {
        let mut pool = self.pool.write().await;
        pool.insert(address, Arc::new(Mutex::new(stream)));
    }

    /// Remove a connection from the pool
    async fn remove_connection(&self, address: &str) {
        let mut pool = self.pool.write().await;
        pool.remove(address);
    }

    /// Get connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}

async fn round_trip(stream: &mut TcpStream, message: &Message) -> Result<Message> {
    let (mut reader, mut writer) = stream.split();
    write_message(&mut writer, message).await?;
    read_message(&mut reader).await
}

/// Gossip over framed TCP
pub struct TcpTransport {
    bind_address: String,
    client: NetworkClient,
}

impl TcpTransport {
    pub fn new(bind_address: String, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            bind_address,
            client: NetworkClient::new(connect_timeout, request_timeout),
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        self.client.send(address, message).await
    }

    async fn serve(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        let server = NetworkServer::bind(&self.bind_address).await?;
        Ok(tokio::spawn(server.run(handler, shutdown)))
    }
}
