//! Cluster Manager
//!
//! Drives the bootstrap/join protocol, owns the membership tracker and the
//! listener registry, and funnels membership changes into a single dispatch
//! worker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{Cluster, ClusterState, Config, Deps};
use crate::error::{Error, Result};
use crate::listener::{ClusterListener, ListenerRegistry};
use crate::membership::{GossipHandler, MembershipEvent, MembershipTracker};
use crate::network::{Message, PeerTransport};
use crate::state::{JoinKind, StateTracker};
use crate::store::{update_database, ClusterStore, Versioned};
use crate::types::{ClusterView, Database, Node, NodeEntry, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Created the cluster record
    Leader,
    Member,
}

struct Inner {
    config: Config,
    store: ClusterStore,
    state: Arc<StateTracker>,
    transport: Arc<dyn PeerTransport>,
    registry: ListenerRegistry,
    tracker: Arc<MembershipTracker>,
    events: Mutex<Option<mpsc::UnboundedReceiver<MembershipEvent>>>,
    phase: watch::Sender<ClusterState>,
    role: Mutex<Option<Role>>,
    /// Latest cluster record seen or written by this node
    database: RwLock<Option<Versioned<Database>>>,
    /// Held by start and shutdown for their whole run
    lifecycle: Mutex<()>,
    /// Stops the heartbeat, watch and dispatch loops
    stop_tx: watch::Sender<bool>,
    /// Stops the gossip endpoint, which outlives the loops
    serve_stop_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    server: Mutex<Option<JoinHandle<()>>>,
    store_failures: AtomicU32,
}

/// Cluster membership coordinator for one node
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<Inner>,
}

impl ClusterManager {
    pub fn new(config: Config, deps: Deps) -> Result<Self> {
        if config.cluster_id.is_empty() {
            return Err(Error::Config("cluster id is required".into()));
        }
        if config.node_id.is_empty() {
            return Err(Error::Config("node id is required".into()));
        }
        if deps.state.node_id() != config.node_id {
            return Err(Error::Config(format!(
                "local state belongs to node {}, not {}",
                deps.state.node_id(),
                config.node_id
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(MembershipTracker::new(
            config.cluster_id.clone(),
            NodeEntry::new(config.node_id.clone(), config.address.clone()),
            config.tracker.clone(),
            Arc::clone(&deps.transport),
            events_tx,
        ));

        let (phase, _) = watch::channel(ClusterState::Uninitialized);
        let (stop_tx, _) = watch::channel(false);
        let (serve_stop_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store: deps.store,
                state: deps.state,
                transport: deps.transport,
                registry: ListenerRegistry::new(),
                tracker,
                events: Mutex::new(Some(events_rx)),
                phase,
                role: Mutex::new(None),
                database: RwLock::new(None),
                lifecycle: Mutex::new(()),
                stop_tx,
                serve_stop_tx,
                loops: Mutex::new(Vec::new()),
                dispatcher: Mutex::new(None),
                server: Mutex::new(None),
                store_failures: AtomicU32::new(0),
            }),
        })
    }

    pub fn state(&self) -> ClusterState {
        *self.inner.phase.borrow()
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn cluster_id(&self) -> &str {
        &self.inner.config.cluster_id
    }

    /// Wait until the manager reaches `Stopped`
    pub async fn wait_stopped(&self) {
        let mut phase = self.inner.phase.subscribe();
        while *phase.borrow_and_update() != ClusterState::Stopped {
            if phase.changed().await.is_err() {
                break;
            }
        }
    }

    fn transition(&self, from: &[ClusterState], to: ClusterState) -> bool {
        let node_id = &self.inner.config.node_id;
        self.inner.phase.send_if_modified(|state| {
            if !from.contains(state) {
                return false;
            }
            tracing::info!("Node {} {} -> {}", node_id, state, to);
            *state = to;
            true
        })
    }

    fn ensure_started(&self) -> Result<()> {
        match self.state() {
            ClusterState::Started => Ok(()),
            ClusterState::Uninitialized => Err(Error::NotInitialized),
            ClusterState::ShuttingDown | ClusterState::Stopped => Err(Error::ShuttingDown),
            other => Err(Error::InvalidState(format!("cluster manager is {}", other))),
        }
    }

    /// Decide between bootstrapping the cluster and joining it.
    ///
    /// Exactly one of the nodes racing on an empty store creates the record;
    /// the others see `VersionConflict` on create and join instead. A record
    /// whose creator never got through `ClusterInit` is taken over the same
    /// way, by a conditional write on its version. Gives up with
    /// `ShuttingDown` once the manager is shut down.
    pub async fn init(&self) -> Result<()> {
        let inner = &self.inner;
        let state = self.state();
        if state != ClusterState::Uninitialized {
            return Err(Error::InvalidState(format!("init called while {}", state)));
        }

        let cluster_id = &inner.config.cluster_id;
        let policy = &inner.config.retry;
        let local = inner.tracker.local_node().await.entry();
        let mut stop = inner.stop_tx.subscribe();
        let mut last_error = None;

        for attempt in 1..=policy.max_attempts.max(1) {
            if attempt > 1 && !*stop.borrow() {
                tokio::select! {
                    _ = tokio::time::sleep(policy.backoff(attempt - 1)) => {}
                    _ = stop.changed() => {}
                }
            }
            if *stop.borrow() {
                return Err(Error::ShuttingDown);
            }

            let expected = match inner.store.read_database(cluster_id).await {
                Ok(current) if current.value.claimable_by(&local.id) => {
                    tracing::info!("Cluster {} was never initialized, claiming it", cluster_id);
                    Some(current.version)
                }
                Ok(current) => {
                    tracing::info!(
                        "Cluster {} exists with {} members, joining",
                        cluster_id,
                        current.value.node_entries.len()
                    );
                    return self.initialized(Role::Member, current).await;
                }
                Err(Error::DatabaseNotFound(_)) => None,
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Cluster store unreachable (attempt {}): {}", attempt, e);
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let fresh = Database::bootstrap(cluster_id, local.clone());
            match inner.store.write_database(cluster_id, &fresh, expected).await {
                Ok(version) => {
                    tracing::info!("Node {} bootstrapped cluster {}", local.id, cluster_id);
                    let current = Versioned { value: fresh, version };
                    return self.initialized(Role::Leader, current).await;
                }
                Err(e) if e.is_conflict() => {
                    tracing::info!("Lost bootstrap race for cluster {}, joining instead", cluster_id);
                    last_error = Some(e);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Cluster store unreachable (attempt {}): {}", attempt, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(Error::StoreUnavailable(reason)) => Err(Error::StoreUnavailable(reason)),
            _ => Err(Error::BootstrapFailed(format!(
                "no stable record for cluster {} after {} attempts",
                cluster_id, policy.max_attempts
            ))),
        }
    }

    async fn initialized(&self, role: Role, current: Versioned<Database>) -> Result<()> {
        *self.inner.role.lock().await = Some(role);
        *self.inner.database.write().await = Some(current);

        let next = match role {
            Role::Leader => ClusterState::Bootstrapping,
            Role::Member => ClusterState::Joining,
        };
        if !self.transition(&[ClusterState::Uninitialized], next) {
            if role == Role::Leader {
                self.withdraw().await;
            }
            return match self.state() {
                ClusterState::Stopped => Err(Error::ShuttingDown),
                _ => Err(Error::InvalidState("init raced with another init".into())),
            };
        }
        Ok(())
    }

    /// Run the setup callbacks, register this node and start the loops.
    /// Setup failures are returned and leave the manager `Stopped`.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        match self.state() {
            ClusterState::Uninitialized => return Err(Error::NotInitialized),
            ClusterState::Bootstrapping | ClusterState::Joining => {}
            _ => return Err(Error::AlreadyStarted),
        }
        self.inner.registry.seal();
        tracing::debug!(
            "Starting node {} with listeners {:?}",
            self.node_id(),
            self.inner.registry.names()
        );

        if let Err(e) = self.join_cluster().await {
            tracing::error!("Node {} failed to start: {}", self.node_id(), e);
            self.inner.stop_tx.send_replace(true);
            self.inner.serve_stop_tx.send_replace(true);
            self.withdraw().await;
            self.transition(
                &[ClusterState::Bootstrapping, ClusterState::Joining],
                ClusterState::Stopped,
            );
            return Err(e);
        }
        Ok(())
    }

    async fn join_cluster(&self) -> Result<()> {
        let inner = &self.inner;
        let cluster_id = inner.config.cluster_id.clone();
        let role = (*inner.role.lock().await).ok_or(Error::NotInitialized)?;
        let db = inner
            .database
            .read()
            .await
            .as_ref()
            .map(|current| current.value.clone())
            .ok_or(Error::NotInitialized)?;
        let this = inner.tracker.local_node().await;

        match role {
            Role::Leader => {
                inner.registry.dispatch_cluster_init(&this, &db).await?;
                inner.state.record_joined(&cluster_id, JoinKind::Bootstrap).await?;
            }
            Role::Member => {
                if inner.state.has_joined(&cluster_id).await? {
                    inner.registry.dispatch_join(&this, &db).await?;
                } else {
                    inner.registry.dispatch_init(&this, &db).await?;
                }
                inner.state.record_joined(&cluster_id, JoinKind::Member).await?;
            }
        }

        let stop = inner.stop_tx.subscribe();
        let entry = this.entry();
        let leader = role == Role::Leader;
        let current = update_database(&inner.store, &cluster_id, &inner.config.retry, Some(&stop), |db| {
            let mut changed = false;
            if db.node_entries.get(&entry.id) != Some(&entry) {
                db.node_entries.insert(entry.id.clone(), entry.clone());
                changed = true;
            }
            if leader && db.status == Status::Init {
                db.status = Status::Ok;
                changed = true;
            }
            changed
        })
        .await?;

        inner.tracker.seed(current.value.node_entries.values()).await;
        *inner.database.write().await = Some(current);
        inner.tracker.local_status_changed(Status::Ok).await;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let handler = GossipHandler::new(cluster_id.clone(), Arc::clone(&inner.tracker), requests_tx);
        let server = inner
            .transport
            .serve(Arc::new(handler), inner.serve_stop_tx.subscribe())
            .await?;
        *inner.server.lock().await = Some(server);

        let events = inner
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::InvalidState("membership events already consumed".into()))?;
        *inner.dispatcher.lock().await = Some(tokio::spawn(
            self.clone().dispatch_events(events, inner.stop_tx.subscribe()),
        ));

        {
            let mut loops = inner.loops.lock().await;
            loops.push(tokio::spawn(
                Arc::clone(&inner.tracker).run(inner.stop_tx.subscribe()),
            ));
            loops.push(tokio::spawn(self.clone().watch_database(inner.stop_tx.subscribe())));
            loops.push(tokio::spawn(
                self.clone().serve_shutdown_requests(requests_rx, inner.stop_tx.subscribe()),
            ));
        }

        if !self.transition(
            &[ClusterState::Bootstrapping, ClusterState::Joining],
            ClusterState::Started,
        ) {
            return Err(Error::ShuttingDown);
        }
        tracing::info!("Node {} started in cluster {}", this.id, cluster_id);
        Ok(())
    }

    /// Drop this node's entry from the record after a start that did not
    /// finish. A record left without members and still `Init` can be claimed
    /// by the next node to bootstrap.
    async fn withdraw(&self) {
        let inner = &self.inner;
        let node_id = inner.config.node_id.clone();
        let result = update_database(&inner.store, &inner.config.cluster_id, &inner.config.retry, None, |db| {
            db.node_entries.remove(&node_id).is_some()
        })
        .await;
        if let Err(e) = result {
            tracing::warn!("Failed to withdraw {} from cluster {}: {}", node_id, inner.config.cluster_id, e);
        }
    }

    /// Single consumer of membership events
    async fn dispatch_events(
        self,
        mut events: mpsc::UnboundedReceiver<MembershipEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let stopped = *stop.borrow();
            if stopped {
                while let Ok(event) = events.try_recv() {
                    self.dispatch(event).await;
                }
                break;
            }

            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Membership dispatch for {} stopped", self.node_id());
    }

    async fn dispatch(&self, event: MembershipEvent) {
        let registry = &self.inner.registry;
        let failures = match &event {
            MembershipEvent::Added(node) => registry.dispatch_add(node).await,
            MembershipEvent::Updated(node) => registry.dispatch_update(node).await,
            MembershipEvent::Removed(node) => registry.dispatch_remove(node).await,
            MembershipEvent::Left(node) => registry.dispatch_leave(node).await,
        };
        if !failures.is_empty() {
            tracing::debug!(
                "{} listener(s) failed {} for node {}",
                failures.len(),
                event.kind(),
                event.node().id
            );
        }
    }

    /// Follow the cluster record; a periodic read doubles as a store health
    /// check since the watch stays silent while nothing changes.
    async fn watch_database(self, mut stop: watch::Receiver<bool>) {
        let cluster_id = self.inner.config.cluster_id.clone();
        let retry = self.inner.config.watch_retry;

        loop {
            if *stop.borrow() {
                break;
            }

            let mut snapshots = self.inner.store.watch(&cluster_id);
            let mut check = tokio::time::interval(retry);
            check.tick().await;

            loop {
                tokio::select! {
                    item = snapshots.next() => match item {
                        Some(Ok(Some(current))) => self.apply_database(current).await,
                        Some(Ok(None)) => {
                            tracing::warn!("Cluster record {} is missing", cluster_id);
                            self.store_failed().await;
                        }
                        Some(Err(e)) => {
                            tracing::warn!("Cluster watch failed: {}", e);
                            self.store_failed().await;
                            break;
                        }
                        None => break,
                    },
                    _ = check.tick() => match self.inner.store.read_database(&cluster_id).await {
                        Ok(current) => self.apply_database(current).await,
                        Err(e) => {
                            tracing::warn!("Cluster store check failed: {}", e);
                            self.store_failed().await;
                            break;
                        }
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                _ = stop.changed() => {}
            }
        }
    }

    async fn apply_database(&self, current: Versioned<Database>) {
        self.store_recovered().await;

        let mut database = self.inner.database.write().await;
        if let Some(known) = database.as_ref() {
            if current.version < known.version {
                return;
            }
        }

        if !current.value.contains(self.node_id()) && self.state() == ClusterState::Started {
            tracing::warn!(
                "Node {} is no longer listed in cluster {}",
                self.node_id(),
                self.cluster_id()
            );
        }
        self.inner.tracker.sync_entries(&current.value).await;
        *database = Some(current);
    }

    async fn store_failed(&self) {
        let failures = self.inner.store_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == self.inner.config.store_failure_threshold.max(1) {
            tracing::error!("Lost contact with the cluster store after {} failures", failures);
            self.inner.tracker.local_status_changed(Status::NotInQuorum).await;
        }
    }

    async fn store_recovered(&self) {
        let failures = self.inner.store_failures.swap(0, Ordering::SeqCst);
        if failures >= self.inner.config.store_failure_threshold.max(1)
            && self.inner.tracker.local_node().await.status == Status::NotInQuorum
        {
            tracing::info!("Cluster store reachable again");
            self.inner.tracker.local_status_changed(Status::Ok).await;
        }
    }

    async fn serve_shutdown_requests(
        self,
        mut requests: mpsc::UnboundedReceiver<String>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                request = requests.recv() => match request {
                    Some(from) => {
                        tracing::info!("Node {} shutting down at the request of {}", self.node_id(), from);
                        // Shutdown joins this task, so it runs detached
                        let manager = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.shutdown_local().await {
                                tracing::error!("Requested shutdown failed: {}", e);
                            }
                        });
                    }
                    None => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    pub fn add_event_listener(&self, listener: Arc<dyn ClusterListener>) -> Result<()> {
        self.inner.registry.register(listener)
    }

    pub async fn enumerate(&self) -> Result<ClusterView> {
        let db = self
            .inner
            .database
            .read()
            .await
            .as_ref()
            .map(|current| current.value.clone())
            .ok_or(Error::NotInitialized)?;
        let local = self.inner.tracker.local_node().await;

        let mut nodes = Vec::with_capacity(db.node_entries.len());
        for entry in db.node_entries.values() {
            if entry.id == local.id {
                nodes.push(local.clone());
                continue;
            }
            let node = self.inner.tracker.peer(&entry.id).await;
            nodes.push(node.unwrap_or_else(|| Node::from_entry(entry)));
        }

        Ok(ClusterView {
            id: db.id,
            status: db.status,
            node_id: local.id,
            nodes,
        })
    }

    pub async fn locate_node(&self, node_id: &str) -> Result<Node> {
        self.enumerate()
            .await?
            .nodes
            .into_iter()
            .find(|node| node.id == node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))
    }

    pub async fn local_node(&self) -> Result<Node> {
        if self.state() == ClusterState::Uninitialized {
            return Err(Error::NotInitialized);
        }
        Ok(self.inner.tracker.local_node().await)
    }

    /// Evict nodes from the cluster record. Present nodes are removed even
    /// when others are unknown; the first unknown id is reported.
    pub async fn remove(&self, nodes: &[String]) -> Result<()> {
        self.ensure_started()?;
        if nodes.iter().any(|id| id == self.node_id()) {
            return Err(Error::InvalidState(
                "the local node leaves through shutdown, not remove".into(),
            ));
        }

        let inner = &self.inner;
        let stop = inner.stop_tx.subscribe();
        let mut missing = Vec::new();
        let current = update_database(&inner.store, self.cluster_id(), &inner.config.retry, Some(&stop), |db| {
            missing.clear();
            let mut changed = false;
            for id in nodes {
                if db.node_entries.remove(id).is_some() {
                    changed = true;
                } else {
                    missing.push(id.clone());
                }
            }
            changed
        })
        .await?;

        for id in nodes.iter().filter(|id| !missing.contains(id)) {
            tracing::info!("Evicted node {} from cluster {}", id, self.cluster_id());
            inner.tracker.evict(id).await;
        }
        self.apply_database(current).await;

        match missing.into_iter().next() {
            Some(id) => Err(Error::NodeNotFound(id)),
            None => Ok(()),
        }
    }

    /// Leave the cluster; with `cluster` set, first ask `nodes` (every other
    /// member when empty) to shut down too
    pub async fn shutdown(&self, cluster: bool, nodes: &[String]) -> Result<()> {
        if cluster {
            self.request_shutdown(nodes).await;
        }
        self.shutdown_local().await
    }

    async fn request_shutdown(&self, nodes: &[String]) {
        let Some(db) = self.inner.database.read().await.as_ref().map(|c| c.value.clone()) else {
            return;
        };

        let targets: Vec<NodeEntry> = db
            .node_entries
            .into_values()
            .filter(|entry| entry.id != self.node_id())
            .filter(|entry| nodes.is_empty() || nodes.contains(&entry.id))
            .collect();

        let timeout = self.inner.config.tracker.probe_timeout;
        let requests = targets.iter().map(|entry| {
            let message = Message::ShutdownRequest {
                cluster_id: self.cluster_id().to_string(),
                from: self.node_id().to_string(),
            };
            async move {
                let reply = tokio::time::timeout(timeout, self.inner.transport.request(&entry.ip, message)).await;
                (entry, reply)
            }
        });

        for (entry, reply) in join_all(requests).await {
            match reply {
                Ok(Ok(Message::Ack)) => tracing::info!("Node {} accepted shutdown", entry.id),
                Ok(Ok(other)) => tracing::warn!("Node {} answered shutdown with {}", entry.id, other.type_name()),
                Ok(Err(e)) => tracing::warn!("Shutdown request to {} failed: {}", entry.id, e),
                Err(_) => tracing::warn!("Shutdown request to {} timed out", entry.id),
            }
        }
    }

    async fn shutdown_local(&self) -> Result<()> {
        let inner = &self.inner;
        // A start in progress finishes first, so whatever it registered is
        // withdrawn below
        let _lifecycle = inner.lifecycle.lock().await;
        match self.state() {
            ClusterState::Stopped | ClusterState::ShuttingDown => return Ok(()),
            ClusterState::Started => {}
            state => {
                // Never started: nothing to announce
                inner.stop_tx.send_replace(true);
                inner.serve_stop_tx.send_replace(true);
                self.transition(
                    &[
                        ClusterState::Uninitialized,
                        ClusterState::Bootstrapping,
                        ClusterState::Joining,
                    ],
                    ClusterState::Stopped,
                );
                if state == ClusterState::Bootstrapping {
                    self.withdraw().await;
                }
                return Ok(());
            }
        }

        if !self.transition(&[ClusterState::Started], ClusterState::ShuttingDown) {
            return Ok(());
        }

        let cluster_id = inner.config.cluster_id.clone();
        let node_id = inner.config.node_id.clone();

        inner.stop_tx.send_replace(true);
        let loops = std::mem::take(&mut *inner.loops.lock().await);
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::warn!("Background task of {} ended abnormally: {}", node_id, e);
            }
        }
        if let Some(dispatcher) = inner.dispatcher.lock().await.take() {
            if let Err(e) = dispatcher.await {
                tracing::warn!("Membership dispatch of {} ended abnormally: {}", node_id, e);
            }
        }

        let this = inner.tracker.local_node().await;
        inner.registry.dispatch_leave(&this).await;

        // Peers learn about the departure before the record drops this node
        let leaving = inner.tracker.bump_local().await;
        let timeout = inner.config.tracker.probe_timeout;
        let peers = inner.tracker.live_peers().await;
        let notices = peers.iter().map(|peer| {
            let message = Message::Leave {
                cluster_id: cluster_id.clone(),
                node: leaving.clone(),
            };
            async move {
                let reply = tokio::time::timeout(timeout, inner.transport.request(&peer.ip, message)).await;
                (peer, reply)
            }
        });
        for (peer, reply) in join_all(notices).await {
            if !matches!(reply, Ok(Ok(Message::Ack))) {
                tracing::debug!("Node {} did not acknowledge leave of {}", peer.id, node_id);
            }
        }

        // The stop signal is already set, so this write runs uncancelled
        let withdrawn = update_database(&inner.store, &cluster_id, &inner.config.retry, None, |db| {
            db.node_entries.remove(&node_id).is_some()
        })
        .await;
        if let Err(e) = &withdrawn {
            tracing::warn!("Failed to remove {} from cluster {}: {}", node_id, cluster_id, e);
        }

        inner.serve_stop_tx.send_replace(true);
        if let Some(server) = inner.server.lock().await.take() {
            if let Err(e) = server.await {
                tracing::warn!("Gossip endpoint of {} ended abnormally: {}", node_id, e);
            }
        }

        self.transition(&[ClusterState::ShuttingDown], ClusterState::Stopped);
        withdrawn.map(|_| ())
    }

    pub async fn set_local_status(&self, status: Status) -> Result<Node> {
        if self.state() == ClusterState::Uninitialized {
            return Err(Error::NotInitialized);
        }
        Ok(self.inner.tracker.local_status_changed(status).await)
    }
}

#[async_trait]
impl Cluster for ClusterManager {
    async fn locate_node(&self, node_id: &str) -> Result<Node> {
        ClusterManager::locate_node(self, node_id).await
    }

    async fn local_node(&self) -> Result<Node> {
        ClusterManager::local_node(self).await
    }

    fn add_event_listener(&self, listener: Arc<dyn ClusterListener>) -> Result<()> {
        ClusterManager::add_event_listener(self, listener)
    }

    async fn enumerate(&self) -> Result<ClusterView> {
        ClusterManager::enumerate(self).await
    }

    async fn remove(&self, nodes: &[String]) -> Result<()> {
        ClusterManager::remove(self, nodes).await
    }

    async fn shutdown(&self, cluster: bool, nodes: &[String]) -> Result<()> {
        ClusterManager::shutdown(self, cluster, nodes).await
    }

    async fn start(&self) -> Result<()> {
        ClusterManager::start(self).await
    }

    async fn set_local_status(&self, status: Status) -> Result<Node> {
        ClusterManager::set_local_status(self, status).await
    }
}
