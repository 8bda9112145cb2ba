//! Collaborators the reconcilers talk to
//!
//! The reconcilers only ever see these traits. [`super::kube_store`],
//! [`super::workload`] and [`super::follow_sessions`] back them with the
//! Kubernetes API; tests back them with in-memory fakes.

use async_trait::async_trait;

use crate::crd::{AddrInfo, CircuitRelay, CircuitRelayStatus, Ipfs, IpfsStatus, SyncPolicy};
use crate::error::Result;

/// Access to the custom resources themselves
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// All relays in `namespace`
    async fn list_relays(&self, namespace: &str) -> Result<Vec<CircuitRelay>>;

    /// Create a relay; an already existing relay of the same name is not an error
    async fn create_relay(&self, relay: &CircuitRelay) -> Result<()>;

    /// Write node status, conditional on `node.metadata.resourceVersion`
    ///
    /// Fails with [`crate::Error::Conflict`] if the node changed since it was read.
    async fn update_node_status(&self, node: &Ipfs, status: &IpfsStatus) -> Result<()>;

    /// Write relay status, conditional on `relay.metadata.resourceVersion`
    async fn update_relay_status(&self, relay: &CircuitRelay, status: &CircuitRelayStatus)
        -> Result<()>;
}

/// Health of a node's backing workload as observed this pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadHealth {
    /// Objects exist but replicas are not ready yet
    Provisioning { message: String },
    Healthy,
    /// Pods are crash looping or cannot start
    Failing { message: String },
}

impl WorkloadHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, WorkloadHealth::Healthy)
    }

    pub fn message(&self) -> &str {
        match self {
            WorkloadHealth::Provisioning { message } | WorkloadHealth::Failing { message } => {
                message
            }
            WorkloadHealth::Healthy => "all replicas ready",
        }
    }
}

/// Observed state of a relay's backing workload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayWorkload {
    pub healthy: bool,
    /// Peer identity and dialable addresses, once known
    pub addr_info: Option<AddrInfo>,
}

/// Starts and observes the processes behind nodes and relays
#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    /// Converge the node's workload and endpoints toward its spec and the
    /// currently bound relay addresses, then report health
    async fn ensure_node_workload(&self, node: &Ipfs, relays: &[AddrInfo])
        -> Result<WorkloadHealth>;

    async fn release_node_workload(&self, node: &Ipfs) -> Result<()>;

    async fn ensure_relay_workload(&self, relay: &CircuitRelay) -> Result<RelayWorkload>;

    async fn release_relay_workload(&self, relay: &CircuitRelay) -> Result<()>;
}

/// An established or requested follow session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FollowSession {
    pub name: String,
    /// Normalized target, the identity of the session
    pub target: String,
    pub policy: SyncPolicy,
}

/// Creates, removes and lists follow sessions for a node
#[async_trait]
pub trait FollowSessionProvider: Send + Sync {
    async fn established(&self, node: &Ipfs) -> Result<Vec<FollowSession>>;

    async fn create(&self, node: &Ipfs, session: &FollowSession) -> Result<()>;

    /// Remove the session whose normalized target is `target`
    async fn remove(&self, node: &Ipfs, target: &str) -> Result<()>;

    /// Drop every session of the node
    async fn clear(&self, node: &Ipfs) -> Result<()>;
}
