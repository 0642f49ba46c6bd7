//! Membership Tracker
//!
//! Peer table, heartbeat rounds and failure detection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::MissedTickBehavior;

use super::{MembershipEvent, TrackerConfig};
use crate::network::{Message, PeerTransport};
use crate::types::{Database, Node, NodeEntry, Status};

/// Why a peer is no longer part of the live view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// Removed by failure detection; still probed and may come back
    Failed,
    /// Announced a graceful departure
    Left,
    /// Evicted or dropped from the cluster record
    Removed,
}

struct Peer {
    node: Node,
    misses: u32,
    offline_since: Option<Instant>,
    departed: Option<Departure>,
    /// Present in the last cluster record seen
    listed: bool,
}

impl Peer {
    fn new(node: Node) -> Self {
        Self {
            node,
            misses: 0,
            offline_since: None,
            departed: None,
            listed: true,
        }
    }

    fn revive(&mut self, node: Node) {
        self.node = node;
        self.misses = 0;
        self.offline_since = None;
        self.departed = None;
    }

    fn probed(&self) -> bool {
        matches!(self.departed, None | Some(Departure::Failed))
    }
}

/// This node's view of every peer's liveness
pub struct MembershipTracker {
    cluster_id: String,
    node_id: String,
    config: TrackerConfig,
    transport: Arc<dyn PeerTransport>,
    local: RwLock<Node>,
    peers: RwLock<HashMap<String, Peer>>,
    events: mpsc::UnboundedSender<MembershipEvent>,
}

impl MembershipTracker {
    /// Create a tracker for the local node. Its generation starts at the
    /// current time in microseconds so a restarted process always outranks
    /// its previous incarnation.
    pub fn new(
        cluster_id: String,
        local: NodeEntry,
        config: TrackerConfig,
        transport: Arc<dyn PeerTransport>,
        events: mpsc::UnboundedSender<MembershipEvent>,
    ) -> Self {
        let now = Utc::now();
        let node = Node {
            id: local.id.clone(),
            ip: local.ip,
            status: Status::Init,
            gen_number: now.timestamp_micros().max(0) as u64,
            timestamp: now,
        };

        Self {
            cluster_id,
            node_id: local.id,
            config,
            transport,
            local: RwLock::new(node),
            peers: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn emit(&self, event: MembershipEvent) {
        tracing::debug!("Membership event {} for node {}", event.kind(), event.node().id);
        if self.events.send(event).is_err() {
            tracing::debug!("Membership event queue closed");
        }
    }

    /// Current snapshot of the local node
    pub async fn local_node(&self) -> Node {
        self.local.read().await.clone()
    }

    /// Advance the local generation and return the fresh snapshot
    pub async fn bump_local(&self) -> Node {
        let mut local = self.local.write().await;
        local.gen_number += 1;
        local.timestamp = Utc::now();
        local.clone()
    }

    /// Publish a new local status through subsequent heartbeats
    pub async fn local_status_changed(&self, status: Status) -> Node {
        let mut local = self.local.write().await;
        if local.status != status {
            tracing::info!("Local node {} status {} -> {}", local.id, local.status, status);
        }
        local.status = status;
        local.gen_number += 1;
        local.timestamp = Utc::now();
        local.clone()
    }

    /// Prime the peer table; every new peer is announced as `Added`
    pub async fn seed<'a>(&self, entries: impl IntoIterator<Item = &'a NodeEntry>) -> usize {
        let mut peers = self.peers.write().await;
        entries
            .into_iter()
            .filter(|entry| self.discover(&mut peers, entry))
            .count()
    }

    /// Reconcile the peer table with a cluster record snapshot
    pub async fn sync_entries(&self, db: &Database) {
        let mut peers = self.peers.write().await;
        for entry in db.node_entries.values() {
            self.discover(&mut peers, entry);
        }

        for (id, peer) in peers.iter_mut() {
            if !peer.listed || db.contains(id) {
                continue;
            }
            peer.listed = false;
            if peer.departed.is_none() {
                tracing::info!("Node {} dropped from the cluster record", id);
                peer.departed = Some(Departure::Removed);
                self.emit(MembershipEvent::Removed(peer.node.clone()));
            }
        }
    }

    /// Returns whether `entry` was announced as `Added`
    fn discover(&self, peers: &mut HashMap<String, Peer>, entry: &NodeEntry) -> bool {
        if entry.id == self.node_id {
            return false;
        }

        let Some(peer) = peers.get_mut(&entry.id) else {
            tracing::info!("Discovered node {} at {}", entry.id, entry.ip);
            let node = Node::from_entry(entry);
            peers.insert(entry.id.clone(), Peer::new(node.clone()));
            self.emit(MembershipEvent::Added(node));
            return true;
        };

        if !peer.listed {
            peer.listed = true;
            if peer.departed.is_some() {
                tracing::info!("Node {} rejoined the cluster record", entry.id);
                let node = Node {
                    gen_number: peer.node.gen_number,
                    ..Node::from_entry(entry)
                };
                peer.revive(node.clone());
                self.emit(MembershipEvent::Added(node));
                return true;
            }
        }

        if peer.node.ip != entry.ip {
            tracing::info!("Node {} moved from {} to {}", entry.id, peer.node.ip, entry.ip);
            peer.node = Node {
                ip: entry.ip.clone(),
                timestamp: Utc::now(),
                ..peer.node.clone()
            };
            if peer.departed.is_none() {
                self.emit(MembershipEvent::Updated(peer.node.clone()));
            }
        }
        false
    }

    /// Apply a snapshot a peer produced of itself. Returns `false` for
    /// unknown peers and for generations not newer than the last accepted.
    pub async fn record_alive(&self, node: Node) -> bool {
        if node.id == self.node_id {
            return false;
        }

        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(&node.id) else {
            tracing::trace!("Ignoring snapshot of unknown node {}", node.id);
            return false;
        };

        if node.gen_number <= peer.node.gen_number {
            tracing::trace!(
                "Ignoring stale snapshot of {} (gen {} <= {})",
                node.id,
                node.gen_number,
                peer.node.gen_number
            );
            return false;
        }

        match peer.departed {
            Some(Departure::Left) | Some(Departure::Removed) => {
                tracing::trace!("Ignoring snapshot of departed node {}", node.id);
                false
            }
            Some(Departure::Failed) => {
                tracing::info!("Node {} is reachable again", node.id);
                peer.revive(node.clone());
                self.emit(MembershipEvent::Added(node));
                true
            }
            None => {
                let changed = peer.node.status != node.status;
                peer.revive(node.clone());
                if changed {
                    self.emit(MembershipEvent::Updated(node));
                }
                true
            }
        }
    }

    async fn record_miss(&self, id: &str) {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(id) else {
            return;
        };
        if peer.departed.is_some() {
            return;
        }

        peer.misses += 1;
        if peer.misses >= self.config.suspect_after_misses.max(1) && peer.offline_since.is_none() {
            tracing::warn!("Node {} missed {} heartbeats, marking offline", id, peer.misses);
            peer.offline_since = Some(Instant::now());
            peer.node = Node {
                status: Status::Offline,
                timestamp: Utc::now(),
                ..peer.node.clone()
            };
            self.emit(MembershipEvent::Updated(peer.node.clone()));
        }
    }

    /// Remove peers that stayed offline for the whole grace period
    pub async fn expire(&self) {
        let grace = self.config.removal_grace;
        let mut peers = self.peers.write().await;
        for (id, peer) in peers.iter_mut() {
            let expired = peer.offline_since.map(|since| since.elapsed() >= grace).unwrap_or(false);
            if peer.departed.is_none() && expired {
                tracing::warn!("Node {} offline for {:?}, removing", id, grace);
                peer.departed = Some(Departure::Failed);
                self.emit(MembershipEvent::Removed(peer.node.clone()));
            }
        }
    }

    /// A peer announced its departure
    pub async fn peer_left(&self, node: Node) -> bool {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(&node.id) else {
            return false;
        };
        if node.gen_number < peer.node.gen_number {
            return false;
        }

        match peer.departed {
            None => {
                tracing::info!("Node {} left the cluster", node.id);
                peer.departed = Some(Departure::Left);
                peer.node = node.clone();
                self.emit(MembershipEvent::Left(node));
                true
            }
            Some(Departure::Failed) => {
                peer.departed = Some(Departure::Left);
                false
            }
            Some(_) => false,
        }
    }

    /// Administrative removal; announces `Removed` unless already departed
    pub async fn evict(&self, id: &str) -> bool {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(id) else {
            return false;
        };

        match peer.departed {
            None => {
                peer.departed = Some(Departure::Removed);
                self.emit(MembershipEvent::Removed(peer.node.clone()));
                true
            }
            Some(Departure::Failed) => {
                peer.departed = Some(Departure::Removed);
                false
            }
            Some(_) => false,
        }
    }

    /// Last known state of a peer
    pub async fn peer(&self, id: &str) -> Option<Node> {
        self.peers.read().await.get(id).map(|peer| peer.node.clone())
    }

    /// Peers that have not departed
    pub async fn live_peers(&self) -> Vec<Node> {
        let peers = self.peers.read().await;
        let mut live: Vec<Node> = peers
            .values()
            .filter(|peer| peer.departed.is_none())
            .map(|peer| peer.node.clone())
            .collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        live
    }

    /// Probe every peer once, then expire long-offline peers
    pub async fn probe_round(&self) {
        let targets: Vec<(String, String)> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|peer| peer.probed())
                .map(|peer| (peer.node.id.clone(), peer.node.ip.clone()))
                .collect()
        };

        if !targets.is_empty() {
            let local = self.bump_local().await;
            let probes = targets.into_iter().map(|(id, ip)| {
                let message = Message::Heartbeat {
                    cluster_id: self.cluster_id.clone(),
                    node: local.clone(),
                };
                async move {
                    let reply = tokio::time::timeout(
                        self.config.probe_timeout,
                        self.transport.request(&ip, message),
                    )
                    .await;
                    (id, ip, reply)
                }
            });

            for (id, ip, reply) in join_all(probes).await {
                match reply {
                    Ok(Ok(Message::HeartbeatAck { node })) if node.id == id => {
                        self.record_alive(node).await;
                    }
                    Ok(Ok(Message::Error { code, message })) => {
                        tracing::warn!("Node {} at {} rejected heartbeat ({:?}): {}", id, ip, code, message);
                        self.record_miss(&id).await;
                    }
                    Ok(Ok(other)) => {
                        tracing::warn!("Unexpected {} from {} at {}", other.type_name(), id, ip);
                        self.record_miss(&id).await;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!("Heartbeat to {} at {} failed: {}", id, ip, e);
                        self.record_miss(&id).await;
                    }
                    Err(_) => {
                        tracing::debug!("Heartbeat to {} at {} timed out", id, ip);
                        self.record_miss(&id).await;
                    }
                }
            }
        }

        self.expire().await;
    }

    /// Heartbeat loop; runs until `shutdown` turns true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Heartbeat loop started for {} (interval {:?})",
            self.node_id,
            self.config.heartbeat_interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => self.probe_round().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Heartbeat loop for {} stopped", self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::membership::GossipHandler;
    use crate::network::LoopbackNetwork;

    fn drain(rx: &mut mpsc::UnboundedReceiver<MembershipEvent>) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn kinds(events: &[MembershipEvent]) -> Vec<(&'static str, String)> {
        events.iter().map(|e| (e.kind(), e.node().id.clone())).collect()
    }

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            heartbeat_interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(100),
            suspect_after_misses: 2,
            removal_grace: Duration::from_millis(50),
        }
    }

    fn tracker(
        network: &LoopbackNetwork,
        id: &str,
    ) -> (Arc<MembershipTracker>, mpsc::UnboundedReceiver<MembershipEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = MembershipTracker::new(
            "c1".to_string(),
            NodeEntry::new(id, id),
            fast_config(),
            Arc::new(network.transport(id)),
            tx,
        );
        (Arc::new(tracker), rx)
    }

    async fn serve(network: &LoopbackNetwork, tracker: &Arc<MembershipTracker>) -> watch::Sender<bool> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (requests, _) = mpsc::unbounded_channel();
        let handler = GossipHandler::new("c1".to_string(), Arc::clone(tracker), requests);
        network
            .transport(tracker.node_id())
            .serve(Arc::new(handler), stop_rx)
            .await
            .unwrap();
        stop_tx
    }

    use crate::network::PeerTransport as _;

    #[tokio::test]
    async fn test_seed_skips_self_and_known() {
        let network = LoopbackNetwork::new();
        let (a, mut events) = tracker(&network, "a");
        let entries = vec![NodeEntry::new("a", "a"), NodeEntry::new("b", "b")];

        assert_eq!(a.seed(&entries).await, 1);
        assert_eq!(a.seed(&entries).await, 0);
        assert_eq!(kinds(&drain(&mut events)), vec![("Added", "b".to_string())]);
        assert_eq!(a.peer("b").await.unwrap().status, Status::Init);
    }

    #[tokio::test]
    async fn test_generation_ordering() {
        let network = LoopbackNetwork::new();
        let (a, mut events) = tracker(&network, "a");
        a.seed(&[NodeEntry::new("b", "b")]).await;
        drain(&mut events);

        let mut b = Node::from_entry(&NodeEntry::new("b", "b"));
        b.gen_number = 10;
        b.status = Status::Ok;
        assert!(a.record_alive(b.clone()).await);

        // Older generation carrying a different status is ignored
        let stale = Node { gen_number: 9, status: Status::Error, ..b.clone() };
        assert!(!a.record_alive(stale).await);
        assert_eq!(a.peer("b").await.unwrap().status, Status::Ok);

        // Newer generation without a status change is not an event
        assert!(a.record_alive(Node { gen_number: 11, ..b.clone() }).await);

        assert_eq!(kinds(&drain(&mut events)), vec![("Updated", "b".to_string())]);

        // Unknown nodes are learned from the cluster record, not heartbeats
        let stranger = Node { id: "z".to_string(), gen_number: 99, ..b };
        assert!(!a.record_alive(stranger).await);
    }

    #[tokio::test]
    async fn test_failure_detection_removes_once() {
        let network = LoopbackNetwork::new();
        let (a, mut events) = tracker(&network, "a");
        let (b, _) = tracker(&network, "b");
        b.local_status_changed(Status::Ok).await;
        let _stop_b = serve(&network, &b).await;

        a.seed(&[NodeEntry::new("b", "b")]).await;
        a.probe_round().await;
        assert_eq!(a.peer("b").await.unwrap().status, Status::Ok);

        network.partition("b");
        for _ in 0..3 {
            a.probe_round().await;
        }
        assert_eq!(a.peer("b").await.unwrap().status, Status::Offline);

        tokio::time::sleep(Duration::from_millis(80)).await;
        for _ in 0..3 {
            a.probe_round().await;
        }

        let seen = kinds(&drain(&mut events));
        assert_eq!(
            seen,
            vec![
                ("Added", "b".to_string()),
                ("Updated", "b".to_string()),
                ("Updated", "b".to_string()),
                ("Removed", "b".to_string()),
            ]
        );
        assert!(a.live_peers().await.is_empty());

        // Recovery after removal is a fresh Added
        network.heal("b");
        a.probe_round().await;
        assert_eq!(kinds(&drain(&mut events)), vec![("Added", "b".to_string())]);
        assert_eq!(a.live_peers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_record_sync_and_leave() {
        let network = LoopbackNetwork::new();
        let (a, mut events) = tracker(&network, "a");

        let mut db = Database::bootstrap("c1", NodeEntry::new("a", "a"));
        db.node_entries.insert("b".into(), NodeEntry::new("b", "b"));
        db.node_entries.insert("c".into(), NodeEntry::new("c", "c"));
        a.sync_entries(&db).await;
        assert_eq!(drain(&mut events).len(), 2);

        // c drops out of the record: exactly one Removed
        db.node_entries.remove("c");
        a.sync_entries(&db).await;
        a.sync_entries(&db).await;
        assert_eq!(kinds(&drain(&mut events)), vec![("Removed", "c".to_string())]);

        // b leaves gracefully, then drops out: Left and nothing else
        let leaving = a.peer("b").await.unwrap();
        assert!(a.peer_left(leaving).await);
        db.node_entries.remove("b");
        a.sync_entries(&db).await;
        assert_eq!(kinds(&drain(&mut events)), vec![("Left", "b".to_string())]);

        // b comes back
        db.node_entries.insert("b".into(), NodeEntry::new("b", "b"));
        a.sync_entries(&db).await;
        assert_eq!(kinds(&drain(&mut events)), vec![("Added", "b".to_string())]);
    }

    #[tokio::test]
    async fn test_evict_after_failure_is_silent() {
        let network = LoopbackNetwork::new();
        let (a, mut events) = tracker(&network, "a");
        a.seed(&[NodeEntry::new("b", "b"), NodeEntry::new("c", "c")]).await;
        drain(&mut events);

        assert!(a.evict("b").await);
        assert!(!a.evict("b").await);
        assert!(!a.evict("unknown").await);
        assert_eq!(kinds(&drain(&mut events)), vec![("Removed", "b".to_string())]);
    }

    #[tokio::test]
    async fn test_local_generation_is_monotonic() {
        let network = LoopbackNetwork::new();
        let (a, _) = tracker(&network, "a");
        let first = a.local_node().await;
        let bumped = a.bump_local().await;
        let changed = a.local_status_changed(Status::NotInQuorum).await;

        assert!(bumped.gen_number > first.gen_number);
        assert!(changed.gen_number > bumped.gen_number);
        assert_eq!(a.local_node().await.status, Status::NotInQuorum);
    }
}
