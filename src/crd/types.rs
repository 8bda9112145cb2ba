//! Shared types for IPFS node and circuit relay specifications
//!
//! # Type Hierarchy
//!
//! - [`Networking`] - Public or private exposure of a node's swarm endpoints
//! - [`RelayRequirement`] - Which circuit relays a node binds to (by name or from a pool)
//! - [`FollowParams`] - An external cluster or peer a node follows, with its [`SyncPolicy`]
//! - [`StorageConfig`] - Volume sizes for the IPFS datastore and the cluster state
//! - [`AddrInfo`] - A peer identifier plus its dialable multiaddrs
//! - [`Condition`] - Kubernetes-style status condition

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Networking mode of a node, with the parameters that only make sense for that mode
///
/// ```yaml
/// networking:
///   mode: public
///   serviceType: LoadBalancer
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Networking {
    /// Swarm port is exposed outside the cluster
    Public(PublicNetworking),
    /// Swarm port is only reachable inside the cluster; peers reach it through relays
    Private(PrivateNetworking),
}

impl Default for Networking {
    fn default() -> Self {
        Networking::Private(PrivateNetworking::default())
    }
}

impl Networking {
    pub fn is_public(&self) -> bool {
        matches!(self, Networking::Public(_))
    }
}

impl std::fmt::Display for Networking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Networking::Public(_) => write!(f, "public"),
            Networking::Private(_) => write!(f, "private"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublicNetworking {
    /// How the swarm Service is exposed
    #[serde(default)]
    pub service_type: ExposureType,

    /// Extra multiaddrs to announce (e.g. a DNS name in front of the load balancer)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub announce_addresses: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrivateNetworking {}

/// Kubernetes Service type used for a public node's swarm endpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ExposureType {
    #[default]
    LoadBalancer,
    NodePort,
}

impl std::fmt::Display for ExposureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExposureType::LoadBalancer => write!(f, "LoadBalancer"),
            ExposureType::NodePort => write!(f, "NodePort"),
        }
    }
}

/// Circuit relays a node depends on
///
/// Either an explicit list of `CircuitRelay` names or a pool from which the
/// operator picks `count` ready relays.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum RelayRequirement {
    Named(Vec<String>),
    Pool(RelayPool),
}

impl RelayRequirement {
    /// True when at least one relay must be bound
    pub fn is_required(&self) -> bool {
        match self {
            RelayRequirement::Named(names) => !names.is_empty(),
            RelayRequirement::Pool(pool) => pool.count > 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RelayPool {
    /// Number of relays to bind
    pub count: u32,

    /// Only relays carrying all of these labels are candidates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    /// Create `<node>-relay-<i>` relays when too few candidates exist
    #[serde(default = "default_true")]
    pub provision: bool,
}

fn default_true() -> bool {
    true
}

/// An external peer or cluster this node mirrors content from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FollowParams {
    /// Session name, used as the follower's cluster name
    pub name: String,

    /// Target to follow: a configuration URL, a multiaddr or a peer identifier
    pub template: String,

    #[serde(default)]
    pub policy: SyncPolicy,
}

/// How often a follow session syncs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncPolicy {
    /// Follow the pinset continuously
    #[default]
    Continuous,
    /// Re-sync the pinset on a fixed interval
    #[serde(rename_all = "camelCase")]
    Periodic { interval_seconds: u64 },
}

/// Storage configuration for the node's volumes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Size of the IPFS datastore volume
    #[serde(default = "default_ipfs_size")]
    pub ipfs_size: String,

    /// Size of the ipfs-cluster state volume
    #[serde(default = "default_cluster_size")]
    pub cluster_size: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

fn default_ipfs_size() -> String {
    "10Gi".to_string()
}

fn default_cluster_size() -> String {
    "1Gi".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ipfs_size: default_ipfs_size(),
            cluster_size: default_cluster_size(),
            storage_class: None,
        }
    }
}

/// A peer's identity plus its dialable multiaddrs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddrInfo {
    /// libp2p peer ID
    pub id: String,
    /// Multiaddrs the peer listens on
    pub addrs: Vec<String>,
}

impl AddrInfo {
    /// An address is usable only with an identifier and at least one address
    pub fn is_complete(&self) -> bool {
        !self.id.is_empty() && self.addrs.iter().any(|a| !a.is_empty())
    }

    /// Multiaddrs with the `/p2p/<id>` suffix appended, as dialed by peers
    pub fn p2p_addrs(&self) -> Vec<String> {
        self.addrs
            .iter()
            .filter(|a| !a.is_empty())
            .map(|a| format!("{}/p2p/{}", a.trim_end_matches('/'), self.id))
            .collect()
    }
}

/// Kubernetes-style condition for status reporting
///
/// # Example
///
/// ```rust
/// use ipfs_operator::crd::Condition;
///
/// let condition = Condition::new("Ready", true, "Ready", "Node is ready");
/// assert_eq!(condition.status, "True");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "RelayBound")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned, RFC 3339
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}
