//! In-memory collaborators for reconciler tests

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::crd::{
    AddrInfo, CircuitRelay, CircuitRelaySpec, CircuitRelayStatus, Ipfs, IpfsSpec, IpfsStatus,
};
use crate::error::{Error, Result};

use super::context::{Context, ReconcileConfig};
use super::runtime::{
    FollowSession, FollowSessionProvider, RelayWorkload, ResourceStore, WorkloadHealth,
    WorkloadRuntime,
};

pub const NAMESPACE: &str = "default";

fn bump_version(meta: &mut ObjectMeta) {
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    meta.resource_version = Some(next.to_string());
}

pub fn addr_info(peer: &str) -> AddrInfo {
    AddrInfo {
        id: format!("12D3KooW{peer}"),
        addrs: vec!["/ip4/203.0.113.10/tcp/4001".to_string()],
    }
}

#[derive(Default)]
pub struct FakeStore {
    nodes: Mutex<BTreeMap<String, Ipfs>>,
    relays: Mutex<BTreeMap<String, CircuitRelay>>,
    conflict_next_write: AtomicBool,
    pub node_status_writes: AtomicUsize,
    pub relay_status_writes: AtomicUsize,
}

impl FakeStore {
    pub fn add_node(&self, name: &str, spec: IpfsSpec) {
        let node = Ipfs {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                uid: Some(format!("uid-{name}")),
                generation: Some(1),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        };
        self.nodes.lock().unwrap().insert(name.to_string(), node);
    }

    pub fn node(&self, name: &str) -> Ipfs {
        self.nodes.lock().unwrap()[name].clone()
    }

    pub fn node_status(&self, name: &str) -> IpfsStatus {
        self.node(name).status.unwrap_or_default()
    }

    /// Edit a node's spec the way a user would, bumping its generation
    pub fn edit_node(&self, name: &str, edit: impl FnOnce(&mut IpfsSpec)) {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(name).unwrap();
        edit(&mut node.spec);
        node.metadata.generation = node.metadata.generation.map(|g| g + 1);
        bump_version(&mut node.metadata);
    }

    pub fn add_relay(&self, name: &str, labels: &[(&str, &str)], addr: Option<AddrInfo>) {
        let relay = CircuitRelay {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                uid: Some(format!("uid-{name}")),
                resource_version: Some("1".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: CircuitRelaySpec {},
            status: addr.map(|addr_info| CircuitRelayStatus {
                addr_info: Some(addr_info),
                conditions: None,
            }),
        };
        self.relays.lock().unwrap().insert(name.to_string(), relay);
    }

    pub fn relay(&self, name: &str) -> Option<CircuitRelay> {
        self.relays.lock().unwrap().get(name).cloned()
    }

    pub fn relay_names(&self) -> Vec<String> {
        self.relays.lock().unwrap().keys().cloned().collect()
    }

    pub fn publish_relay(&self, name: &str, addr: AddrInfo) {
        let mut relays = self.relays.lock().unwrap();
        let relay = relays.get_mut(name).unwrap();
        relay.status.get_or_insert_with(Default::default).addr_info = Some(addr);
        bump_version(&mut relay.metadata);
    }

    pub fn delete_relay(&self, name: &str) {
        self.relays.lock().unwrap().remove(name);
    }

    /// Make the next status write lose the optimistic-concurrency race
    pub fn fail_next_write_with_conflict(&self) {
        self.conflict_next_write.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn list_relays(&self, namespace: &str) -> Result<Vec<CircuitRelay>> {
        Ok(self
            .relays
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn create_relay(&self, relay: &CircuitRelay) -> Result<()> {
        let mut relay = relay.clone();
        relay.metadata.resource_version = Some("1".to_string());
        self.relays
            .lock()
            .unwrap()
            .entry(relay.name_any())
            .or_insert(relay);
        Ok(())
    }

    async fn update_node_status(&self, node: &Ipfs, status: &IpfsStatus) -> Result<()> {
        let what = format!("ipfs {}", node.name_any());
        if self.conflict_next_write.swap(false, Ordering::SeqCst) {
            return Err(Error::Conflict(what));
        }
        let mut nodes = self.nodes.lock().unwrap();
        let stored = nodes
            .get_mut(&node.name_any())
            .ok_or_else(|| Error::NotFound(what.clone()))?;
        if stored.metadata.resource_version != node.metadata.resource_version {
            return Err(Error::Conflict(what));
        }
        stored.status = Some(status.clone());
        bump_version(&mut stored.metadata);
        self.node_status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_relay_status(
        &self,
        relay: &CircuitRelay,
        status: &CircuitRelayStatus,
    ) -> Result<()> {
        let what = format!("circuitrelay {}", relay.name_any());
        let mut relays = self.relays.lock().unwrap();
        let stored = relays
            .get_mut(&relay.name_any())
            .ok_or_else(|| Error::NotFound(what.clone()))?;
        if stored.metadata.resource_version != relay.metadata.resource_version {
            return Err(Error::Conflict(what));
        }
        stored.status = Some(status.clone());
        bump_version(&mut stored.metadata);
        self.relay_status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeRuntime {
    pub node_health: Mutex<WorkloadHealth>,
    /// Number of upcoming node workload calls that fail with a timeout
    pub node_failures: AtomicUsize,
    pub node_config_error: AtomicBool,
    /// Relay addresses each node workload was last applied with
    pub applied_relays: Mutex<BTreeMap<String, Vec<AddrInfo>>>,
    pub relay_workloads: Mutex<BTreeMap<String, RelayWorkload>>,
    pub released: Mutex<Vec<String>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            node_health: Mutex::new(WorkloadHealth::Healthy),
            node_failures: AtomicUsize::new(0),
            node_config_error: AtomicBool::new(false),
            applied_relays: Mutex::new(BTreeMap::new()),
            relay_workloads: Mutex::new(BTreeMap::new()),
            released: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRuntime {
    pub fn set_node_health(&self, health: WorkloadHealth) {
        *self.node_health.lock().unwrap() = health;
    }

    pub fn set_relay_workload(&self, name: &str, healthy: bool, addr_info: Option<AddrInfo>) {
        self.relay_workloads
            .lock()
            .unwrap()
            .insert(name.to_string(), RelayWorkload { healthy, addr_info });
    }
}

#[async_trait]
impl WorkloadRuntime for FakeRuntime {
    async fn ensure_node_workload(&self, node: &Ipfs, relays: &[AddrInfo]) -> Result<WorkloadHealth> {
        if self.node_config_error.load(Ordering::SeqCst) {
            return Err(Error::ConfigError("storage class does not exist".to_string()));
        }
        let pending_failures = self.node_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.node_failures.store(pending_failures - 1, Ordering::SeqCst);
            return Err(Error::Timeout("statefulset apply".to_string()));
        }
        self.applied_relays
            .lock()
            .unwrap()
            .insert(node.name_any(), relays.to_vec());
        Ok(self.node_health.lock().unwrap().clone())
    }

    async fn release_node_workload(&self, node: &Ipfs) -> Result<()> {
        self.released.lock().unwrap().push(format!("ipfs/{}", node.name_any()));
        Ok(())
    }

    async fn ensure_relay_workload(&self, relay: &CircuitRelay) -> Result<RelayWorkload> {
        Ok(self
            .relay_workloads
            .lock()
            .unwrap()
            .get(&relay.name_any())
            .cloned()
            .unwrap_or_default())
    }

    async fn release_relay_workload(&self, relay: &CircuitRelay) -> Result<()> {
        self.released
            .lock()
            .unwrap()
            .push(format!("circuitrelay/{}", relay.name_any()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFollows {
    sessions: Mutex<BTreeMap<String, Vec<FollowSession>>>,
    /// Targets whose session creation fails
    pub unreachable: Mutex<HashSet<String>>,
    pub creates: AtomicUsize,
    pub removes: AtomicUsize,
}

impl FakeFollows {
    pub fn sessions(&self, node: &str) -> Vec<FollowSession> {
        self.sessions
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    pub fn mark_unreachable(&self, target: &str) {
        self.unreachable.lock().unwrap().insert(target.to_string());
    }
}

#[async_trait]
impl FollowSessionProvider for FakeFollows {
    async fn established(&self, node: &Ipfs) -> Result<Vec<FollowSession>> {
        Ok(self.sessions(&node.name_any()))
    }

    async fn create(&self, node: &Ipfs, session: &FollowSession) -> Result<()> {
        if self.unreachable.lock().unwrap().contains(&session.target) {
            return Err(Error::FollowError(format!("{} unreachable", session.target)));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut all = self.sessions.lock().unwrap();
        let sessions = all.entry(node.name_any()).or_default();
        // Sessions are keyed by name, as in the ConfigMap provider
        sessions.retain(|s| s.name != session.name);
        sessions.push(session.clone());
        Ok(())
    }

    async fn remove(&self, node: &Ipfs, target: &str) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if let Some(sessions) = self.sessions.lock().unwrap().get_mut(&node.name_any()) {
            sessions.retain(|s| s.target != target);
        }
        Ok(())
    }

    async fn clear(&self, node: &Ipfs) -> Result<()> {
        self.sessions.lock().unwrap().remove(&node.name_any());
        Ok(())
    }
}

/// A reconcile context wired to in-memory collaborators
pub struct Harness {
    pub store: Arc<FakeStore>,
    pub runtime: Arc<FakeRuntime>,
    pub follows: Arc<FakeFollows>,
    pub ctx: Context,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(FakeStore::default());
        let runtime = Arc::new(FakeRuntime::default());
        let follows = Arc::new(FakeFollows::default());
        let ctx = Context::new(
            store.clone(),
            runtime.clone(),
            follows.clone(),
            ReconcileConfig::default(),
        );
        Self {
            store,
            runtime,
            follows,
            ctx,
        }
    }

    /// One node pass against the latest stored object
    pub async fn reconcile_node(&self, name: &str) -> Result<kube::runtime::controller::Action> {
        let node = self.store.node(name);
        super::node_reconciler::apply_node(&self.ctx, &node).await
    }

    pub async fn reconcile_relay(&self, name: &str) -> Result<kube::runtime::controller::Action> {
        let relay = self
            .store
            .relay(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        super::relay_reconciler::apply_relay(&self.ctx, &relay).await
    }
}
