//! Loopback Transport
//!
//! Routes gossip between nodes hosted in the same process. Addresses can be
//! partitioned to simulate a node becoming unreachable.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{Message, MessageHandler, PeerTransport};
use crate::error::{Error, Result};

#[derive(Default)]
struct Routes {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    partitioned: HashSet<String>,
}

/// Shared in-process network connecting loopback transports
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    routes: Arc<RwLock<Routes>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for the node served at `address`
    pub fn transport(&self, address: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            address: address.into(),
            network: self.clone(),
        }
    }

    /// Cut an address off: messages to and from it fail
    pub fn partition(&self, address: &str) {
        self.write_routes().partitioned.insert(address.to_string());
    }

    /// Reconnect a partitioned address
    pub fn heal(&self, address: &str) {
        self.write_routes().partitioned.remove(address);
    }

    fn write_routes(&self) -> std::sync::RwLockWriteGuard<'_, Routes> {
        self.routes.write().unwrap_or_else(|e| e.into_inner())
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<dyn MessageHandler>> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        if routes.partitioned.contains(from) || routes.partitioned.contains(to) {
            return Err(Error::ConnectionTimeout(to.to_string()));
        }
        routes
            .handlers
            .get(to)
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed {
                address: to.to_string(),
                reason: "connection refused".to_string(),
            })
    }
}

/// One node's endpoint on a `LoopbackNetwork`
pub struct LoopbackTransport {
    address: String,
    network: LoopbackNetwork,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        let handler = self.network.route(&self.address, address)?;
        handler
            .handle(self.address.clone(), message)
            .await
            .ok_or_else(|| Error::Network(format!("{} sent no reply", address)))
    }

    async fn serve(
        &self,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        self.network
            .write_routes()
            .handlers
            .insert(self.address.clone(), handler);

        let network = self.network.clone();
        let address = self.address.clone();
        Ok(tokio::spawn(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            network.write_routes().handlers.remove(&address);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl MessageHandler for Fixed {
        async fn handle(&self, _peer_addr: String, _message: Message) -> Option<Message> {
            Some(Message::Ack)
        }
    }

    #[tokio::test]
    async fn test_route_partition_and_stop() {
        let network = LoopbackNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        let (stop_tx, stop_rx) = watch::channel(false);
        let served = b.serve(Arc::new(Fixed), stop_rx).await.unwrap();

        assert!(matches!(a.request("b", Message::Ack).await.unwrap(), Message::Ack));

        network.partition("b");
        assert!(matches!(a.request("b", Message::Ack).await, Err(Error::ConnectionTimeout(_))));
        network.heal("b");
        assert!(a.request("b", Message::Ack).await.is_ok());

        stop_tx.send_replace(true);
        served.await.unwrap();
        assert!(matches!(a.request("b", Message::Ack).await, Err(Error::ConnectionFailed { .. })));
    }
}
