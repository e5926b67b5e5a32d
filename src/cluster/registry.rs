use crate::error::StatikoError;
use crate::state::NodeHealth;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// Deadline for collecting health replies from every connected node.
const HEALTH_COLLECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Channel a connection's event loop listens on for "send your health"
/// requests. Each request carries the slot the reply goes into.
pub type HealthRequestSender = mpsc::UnboundedSender<oneshot::Sender<NodeHealth>>;

/// Called with (node_name, joined) on register/unregister.
pub type NodeActivityFn = Box<dyn Fn(&str, bool) + Send + Sync>;

struct NodeEntry {
    version: u64,
    health_tx: HealthRequestSender,
}

struct Inner {
    nodes: HashMap<String, NodeEntry>,
    /// Smallest version reported by any connected node; 0 when empty.
    cluster_min: u64,
    waiters: HashMap<u64, mpsc::UnboundedSender<u64>>,
    next_waiter_id: u64,
}

/// Controller-side map of connected agents.
///
/// `received_version` and waiter notification run under one mutex, so a
/// waiter that saw a stale cluster-min before blocking is guaranteed to be
/// woken by the update that first reaches its threshold.
pub struct NodeRegistry {
    inner: Mutex<Inner>,
    node_activity: Option<NodeActivityFn>,
}

impl NodeRegistry {
    pub fn new(node_activity: Option<NodeActivityFn>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                cluster_min: 0,
                waiters: HashMap::new(),
                next_waiter_id: 0,
            }),
            node_activity,
        }
    }

    /// Register a connected node. A fresh node has reconciled nothing yet,
    /// so the cluster minimum drops to 0 until its first health report.
    pub fn register(&self, name: &str, health_tx: HealthRequestSender) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.nodes.contains_key(name) {
                return Err(StatikoError::NameInUse(name.to_string()).into());
            }
            inner.nodes.insert(
                name.to_string(),
                NodeEntry {
                    version: 0,
                    health_tx,
                },
            );
            inner.cluster_min = 0;
            metrics::gauge!("statiko_nodes_connected").set(inner.nodes.len() as f64);
        }
        info!("registry: node joined, name={}", name);
        if let Some(cb) = &self.node_activity {
            cb(name, true);
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let removed = inner.nodes.remove(name).is_some();
            if removed {
                inner.cluster_min = min_version(&inner.nodes);
                metrics::gauge!("statiko_nodes_connected").set(inner.nodes.len() as f64);
            }
            removed
        };
        if removed {
            info!("registry: node left, name={}", name);
            if let Some(cb) = &self.node_activity {
                cb(name, false);
            }
        }
    }

    /// Record a node's reported version. Non-monotonic updates are allowed
    /// because a node can be wiped and replaced under the same name. The
    /// new cluster minimum is delivered to every waiter while the lock is
    /// held.
    pub fn received_version(&self, name: &str, version: u64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.nodes.get_mut(name) else {
            return;
        };
        entry.version = version;
        inner.cluster_min = min_version(&inner.nodes);

        let min = inner.cluster_min;
        inner.waiters.retain(|_, tx| tx.send(min).is_ok());
    }

    pub fn cluster_min_version(&self) -> u64 {
        self.inner.lock().unwrap().cluster_min
    }

    pub fn node_versions(&self) -> Vec<(String, u64)> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<_> = inner
            .nodes
            .iter()
            .map(|(name, e)| (name.clone(), e.version))
            .collect();
        out.sort();
        out
    }

    /// Block until every connected node has reconciled at least `version`.
    /// Returns immediately when the cluster minimum is already there.
    pub async fn wait_for_version(&self, version: u64) -> Result<()> {
        let (waiter_id, mut rx) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cluster_min >= version {
                return Ok(());
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiters.insert(id, tx);
            (id, rx)
        };

        let result = loop {
            match rx.recv().await {
                Some(min) if min >= version => break Ok(()),
                Some(_) => continue,
                None => {
                    break Err(
                        StatikoError::Internal("registry dropped while waiting".to_string()).into(),
                    )
                }
            }
        };

        self.inner.lock().unwrap().waiters.remove(&waiter_id);
        result
    }

    /// Ask every connected node for a fresh health report and collect the
    /// replies until all arrive or the deadline fires. Nodes that fail to
    /// answer in time appear as placeholders naming the node and the
    /// timeout.
    pub async fn request_cluster_health(&self, timeout: Option<Duration>) -> Vec<NodeHealth> {
        let deadline =
            tokio::time::Instant::now() + timeout.unwrap_or(HEALTH_COLLECT_TIMEOUT);

        let mut pending: Vec<(String, u64, oneshot::Receiver<NodeHealth>)> = Vec::new();
        let mut results: Vec<NodeHealth> = Vec::new();

        {
            let inner = self.inner.lock().unwrap();
            for (name, entry) in &inner.nodes {
                let (tx, rx) = oneshot::channel();
                if entry.health_tx.send(tx).is_ok() {
                    pending.push((name.clone(), entry.version, rx));
                } else {
                    // The connection's loop is gone; report it as unreachable.
                    results.push(placeholder_health(name, entry.version, "channel closed"));
                }
            }
        }

        metrics::counter!("statiko_health_requests_total").increment(1);

        for (name, version, rx) in pending {
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(health)) => results.push(health),
                Ok(Err(_)) => results.push(placeholder_health(&name, version, "channel closed")),
                Err(_) => {
                    results.push(placeholder_health(&name, version, "health request timed out"))
                }
            }
        }

        results.sort_by(|a, b| a.node_name.cmp(&b.node_name));
        results
    }
}

fn min_version(nodes: &HashMap<String, NodeEntry>) -> u64 {
    nodes.values().map(|e| e.version).min().unwrap_or(0)
}

fn placeholder_health(name: &str, version: u64, error: &str) -> NodeHealth {
    NodeHealth {
        node_name: name.to_string(),
        version,
        nginx_running: false,
        last_sync_time: None,
        last_sync_error: Some(error.to_string()),
        sites: Vec::new(),
    }
}
