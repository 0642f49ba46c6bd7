//! Gossip Handler
//!
//! Answers messages arriving from peers on behalf of the membership tracker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::MembershipTracker;
use crate::network::{ErrorCode, Message, MessageHandler};

pub struct GossipHandler {
    cluster_id: String,
    tracker: Arc<MembershipTracker>,
    /// Receives the id of a peer that asked this node to shut down
    shutdown_requests: mpsc::UnboundedSender<String>,
}

impl GossipHandler {
    pub fn new(
        cluster_id: String,
        tracker: Arc<MembershipTracker>,
        shutdown_requests: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            cluster_id,
            tracker,
            shutdown_requests,
        }
    }

    fn mismatch(&self, peer_addr: &str, cluster_id: &str) -> Message {
        tracing::warn!(
            "Rejecting message from {} for cluster {} (this node is in {})",
            peer_addr,
            cluster_id,
            self.cluster_id
        );
        Message::Error {
            code: ErrorCode::ClusterMismatch,
            message: format!("this node belongs to cluster {}", self.cluster_id),
        }
    }
}

#[async_trait]
impl MessageHandler for GossipHandler {
    async fn handle(&self, peer_addr: String, message: Message) -> Option<Message> {
        match message {
            Message::Heartbeat { cluster_id, node } => {
                if cluster_id != self.cluster_id {
                    return Some(self.mismatch(&peer_addr, &cluster_id));
                }
                self.tracker.record_alive(node).await;
                Some(Message::HeartbeatAck {
                    node: self.tracker.bump_local().await,
                })
            }

            Message::Leave { cluster_id, node } => {
                if cluster_id != self.cluster_id {
                    return Some(self.mismatch(&peer_addr, &cluster_id));
                }
                self.tracker.peer_left(node).await;
                Some(Message::Ack)
            }

            Message::ShutdownRequest { cluster_id, from } => {
                if cluster_id != self.cluster_id {
                    return Some(self.mismatch(&peer_addr, &cluster_id));
                }
                tracing::info!("Shutdown requested by {}", from);
                if self.shutdown_requests.send(from).is_err() {
                    return Some(Message::Error {
                        code: ErrorCode::NotRunning,
                        message: "node is not running".to_string(),
                    });
                }
                Some(Message::Ack)
            }

            other => Some(Message::Error {
                code: ErrorCode::Unexpected,
                message: format!("{} is not a request", other.type_name()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::TrackerConfig;
    use crate::network::LoopbackNetwork;
    use crate::types::{Node, NodeEntry, Status};

    fn handler() -> (GossipHandler, Arc<MembershipTracker>, mpsc::UnboundedReceiver<String>) {
        let network = LoopbackNetwork::new();
        let (events, _) = mpsc::unbounded_channel();
        let tracker = Arc::new(MembershipTracker::new(
            "c1".to_string(),
            NodeEntry::new("a", "a"),
            TrackerConfig::default(),
            Arc::new(network.transport("a")),
            events,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        (GossipHandler::new("c1".to_string(), Arc::clone(&tracker), tx), tracker, rx)
    }

    #[tokio::test]
    async fn test_heartbeat_answered_with_fresh_generation() {
        let (handler, tracker, _rx) = handler();
        let before = tracker.local_node().await.gen_number;

        let probe = Message::Heartbeat {
            cluster_id: "c1".into(),
            node: Node::from_entry(&NodeEntry::new("b", "b")),
        };
        match handler.handle("b".into(), probe).await {
            Some(Message::HeartbeatAck { node }) => {
                assert_eq!(node.id, "a");
                assert!(node.gen_number > before);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_foreign_cluster_rejected() {
        let (handler, _tracker, _rx) = handler();
        let probe = Message::Heartbeat {
            cluster_id: "other".into(),
            node: Node::from_entry(&NodeEntry::new("b", "b")),
        };
        assert!(matches!(
            handler.handle("b".into(), probe).await,
            Some(Message::Error { code: ErrorCode::ClusterMismatch, .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_request_forwarded() {
        let (handler, tracker, mut rx) = handler();
        let request = Message::ShutdownRequest {
            cluster_id: "c1".into(),
            from: "b".into(),
        };
        assert!(matches!(handler.handle("b".into(), request).await, Some(Message::Ack)));
        assert_eq!(rx.recv().await.unwrap(), "b");

        // Not a request
        assert!(matches!(
            handler.handle("b".into(), Message::Ack).await,
            Some(Message::Error { code: ErrorCode::Unexpected, .. })
        ));
        assert_eq!(tracker.local_node().await.status, Status::Init);
    }
}
