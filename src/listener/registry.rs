//! Listener Registry
//!
//! Ordered set of listeners. Setup events stop at the first failure;
//! membership events reach every listener regardless of failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use super::ClusterListener;
use crate::error::{Error, Result};
use crate::types::{Database, Node};

#[derive(Debug, Clone, Copy)]
enum Setup {
    ClusterInit,
    Init,
    Join,
}

impl Setup {
    fn name(self) -> &'static str {
        match self {
            Setup::ClusterInit => "ClusterInit",
            Setup::Init => "Init",
            Setup::Join => "Join",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Change {
    Add,
    Update,
    Remove,
    Leave,
}

impl Change {
    fn name(self) -> &'static str {
        match self {
            Change::Add => "Add",
            Change::Update => "Update",
            Change::Remove => "Remove",
            Change::Leave => "Leave",
        }
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn ClusterListener>>>,
    sealed: AtomicBool,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener. Fails once the registry is sealed or if the name
    /// is taken.
    pub fn register(&self, listener: Arc<dyn ClusterListener>) -> Result<()> {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if self.sealed.load(Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let name = listener.name();
        if listeners.iter().any(|l| l.name() == name) {
            return Err(Error::DuplicateListener(name));
        }

        tracing::debug!("Registered cluster listener {}", name);
        listeners.push(listener);
        Ok(())
    }

    /// Refuse further registrations
    pub fn seal(&self) {
        let _guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|l| l.name()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ClusterListener>> {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn dispatch_cluster_init(&self, this: &Node, db: &Database) -> Result<()> {
        self.dispatch_setup(Setup::ClusterInit, this, db).await
    }

    pub async fn dispatch_init(&self, this: &Node, db: &Database) -> Result<()> {
        self.dispatch_setup(Setup::Init, this, db).await
    }

    pub async fn dispatch_join(&self, this: &Node, db: &Database) -> Result<()> {
        self.dispatch_setup(Setup::Join, this, db).await
    }

    async fn dispatch_setup(&self, event: Setup, this: &Node, db: &Database) -> Result<()> {
        for listener in self.snapshot() {
            let result = match event {
                Setup::ClusterInit => listener.cluster_init(this, db).await,
                Setup::Init => listener.init(this, db).await,
                Setup::Join => listener.join(this, db).await,
            };

            if let Err(e) = result {
                let name = listener.name();
                tracing::error!("Listener {} failed {}: {:#}", name, event.name(), e);
                return Err(Error::ListenerSetupFailed {
                    listener: name,
                    event: event.name(),
                    reason: format!("{:#}", e),
                });
            }
        }
        Ok(())
    }

    /// Deliver `Add` in registration order; returns the isolated failures
    pub async fn dispatch_add(&self, node: &Node) -> Vec<Error> {
        self.dispatch_change(Change::Add, node, self.snapshot()).await
    }

    pub async fn dispatch_update(&self, node: &Node) -> Vec<Error> {
        self.dispatch_change(Change::Update, node, self.snapshot()).await
    }

    pub async fn dispatch_remove(&self, node: &Node) -> Vec<Error> {
        self.dispatch_change(Change::Remove, node, self.snapshot()).await
    }

    /// Deliver `Leave` in reverse registration order
    pub async fn dispatch_leave(&self, node: &Node) -> Vec<Error> {
        let mut listeners = self.snapshot();
        listeners.reverse();
        self.dispatch_change(Change::Leave, node, listeners).await
    }

    async fn dispatch_change(
        &self,
        event: Change,
        node: &Node,
        listeners: Vec<Arc<dyn ClusterListener>>,
    ) -> Vec<Error> {
        let mut failures = Vec::new();
        for listener in listeners {
            let result = match event {
                Change::Add => listener.add(node).await,
                Change::Update => listener.update(node).await,
                Change::Remove => listener.remove(node).await,
                Change::Leave => listener.leave(node).await,
            };

            if let Err(e) = result {
                let name = listener.name();
                tracing::warn!("Listener {} failed {} for node {}: {:#}", name, event.name(), node.id, e);
                failures.push(Error::ListenerEventFailed {
                    listener: name,
                    event: event.name(),
                    reason: format!("{:#}", e),
                });
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::types::NodeEntry;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        journal: Journal,
        fail_on: Option<&'static str>,
    }

    impl Recorder {
        fn new(name: &'static str, journal: &Journal) -> Arc<Self> {
            Arc::new(Self { name, journal: Arc::clone(journal), fail_on: None })
        }

        fn failing(name: &'static str, journal: &Journal, event: &'static str) -> Arc<Self> {
            Arc::new(Self { name, journal: Arc::clone(journal), fail_on: Some(event) })
        }

        fn record(&self, event: &str) -> anyhow::Result<()> {
            self.journal.lock().unwrap().push(format!("{}:{}", self.name, event));
            if self.fail_on.map_or(false, |f| f == event) {
                anyhow::bail!("{} refuses {}", self.name, event);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ClusterListener for Recorder {
        fn name(&self) -> String {
            self.name.to_string()
        }
        async fn cluster_init(&self, _this: &Node, _db: &Database) -> anyhow::Result<()> {
            self.record("ClusterInit")
        }
        async fn init(&self, _this: &Node, _db: &Database) -> anyhow::Result<()> {
            self.record("Init")
        }
        async fn add(&self, _node: &Node) -> anyhow::Result<()> {
            self.record("Add")
        }
        async fn update(&self, _node: &Node) -> anyhow::Result<()> {
            self.record("Update")
        }
        async fn leave(&self, _node: &Node) -> anyhow::Result<()> {
            self.record("Leave")
        }
    }

    fn node() -> Node {
        Node::from_entry(&NodeEntry::new("n1", "127.0.0.1:9010"))
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn taken(journal: &Journal) -> Vec<String> {
        std::mem::take(&mut *journal.lock().unwrap())
    }

    #[tokio::test]
    async fn test_dispatch_order() {
        let journal = journal();
        let registry = ListenerRegistry::new();
        for name in ["A", "B", "C"] {
            registry.register(Recorder::new(name, &journal)).unwrap();
        }

        assert!(registry.dispatch_add(&node()).await.is_empty());
        assert_eq!(taken(&journal), vec!["A:Add", "B:Add", "C:Add"]);

        registry.dispatch_update(&node()).await;
        assert_eq!(taken(&journal), vec!["A:Update", "B:Update", "C:Update"]);

        registry.dispatch_leave(&node()).await;
        assert_eq!(taken(&journal), vec!["C:Leave", "B:Leave", "A:Leave"]);
    }

    #[tokio::test]
    async fn test_setup_failure_aborts() {
        let journal = journal();
        let registry = ListenerRegistry::new();
        registry.register(Recorder::new("A", &journal)).unwrap();
        registry.register(Recorder::failing("B", &journal, "Init")).unwrap();
        registry.register(Recorder::new("C", &journal)).unwrap();

        let db = Database::bootstrap("c1", node().entry());
        let err = registry.dispatch_init(&node(), &db).await.unwrap_err();
        match err {
            Error::ListenerSetupFailed { listener, event, .. } => {
                assert_eq!(listener, "B");
                assert_eq!(event, "Init");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(taken(&journal), vec!["A:Init", "B:Init"]);
    }

    #[tokio::test]
    async fn test_event_failure_isolated() {
        let journal = journal();
        let registry = ListenerRegistry::new();
        registry.register(Recorder::failing("A", &journal, "Add")).unwrap();
        registry.register(Recorder::new("B", &journal)).unwrap();

        let failures = registry.dispatch_add(&node()).await;
        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], Error::ListenerEventFailed { listener, .. } if listener == "A"));
        assert_eq!(taken(&journal), vec!["A:Add", "B:Add"]);
    }

    #[test]
    fn test_registration_rules() {
        let journal = journal();
        let registry = ListenerRegistry::new();
        registry.register(Recorder::new("A", &journal)).unwrap();
        assert!(matches!(
            registry.register(Recorder::new("A", &journal)),
            Err(Error::DuplicateListener(name)) if name == "A"
        ));

        registry.seal();
        assert!(matches!(registry.register(Recorder::new("B", &journal)), Err(Error::AlreadyStarted)));
        assert_eq!(registry.names(), vec!["A".to_string()]);
    }
}
