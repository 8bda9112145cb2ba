//! Ipfs Custom Resource Definition
//!
//! An `Ipfs` resource declares one IPFS cluster node: how its swarm port is
//! exposed, which circuit relays it depends on and which external clusters it
//! follows.

use kube::CustomResource;
use multiaddr::Multiaddr;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, FollowParams, Networking, RelayRequirement, StorageConfig};

/// Structured validation error for `IpfsSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.ipfs.io",
    version = "v1alpha1",
    kind = "Ipfs",
    plural = "ipfs",
    namespaced,
    derive = "PartialEq",
    derive = "Default",
    status = "IpfsStatus",
    shortname = "ipfs",
    printcolumn = r#"{"name":"Networking","type":"string","jsonPath":".spec.networking.mode"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Relays","type":"string","jsonPath":".status.circuitRelays"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IpfsSpec {
    #[serde(default)]
    pub networking: Networking,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relays: Option<RelayRequirement>,

    /// External clusters to follow; `None` and an empty list both mean none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follows: Option<Vec<FollowParams>>,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_replicas() -> i32 {
    1
}

impl Default for IpfsSpec {
    fn default() -> Self {
        Self {
            networking: Networking::default(),
            relays: None,
            follows: None,
            replicas: default_replicas(),
            storage: StorageConfig::default(),
        }
    }
}

/// Upper bound on relays a single node may bind
pub const MAX_RELAYS: u32 = 16;

impl IpfsSpec {
    /// Validate the parts of the spec the schema cannot express
    ///
    /// Follow descriptors are validated per entry by
    /// [`crate::controller::follow_sync`], not here.
    pub fn validate(&self, node_name: &str) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.replicas < 1 {
            errors.push(SpecValidationError::new(
                "spec.replicas",
                "replicas must be at least 1",
                "Set spec.replicas to 1 or more.",
            ));
        }

        if let Networking::Public(public) = &self.networking {
            for (i, addr) in public.announce_addresses.iter().enumerate() {
                if let Err(e) = addr.parse::<Multiaddr>() {
                    errors.push(SpecValidationError::new(
                        format!("spec.networking.announceAddresses[{i}]"),
                        format!("'{addr}' is not a multiaddr: {e}"),
                        "Use multiaddr syntax, e.g. /dns4/ipfs.example.org/tcp/4001.",
                    ));
                }
            }
        }

        match &self.relays {
            Some(RelayRequirement::Named(names)) => {
                for (i, name) in names.iter().enumerate() {
                    if name.trim().is_empty() {
                        errors.push(SpecValidationError::new(
                            format!("spec.relays.named[{i}]"),
                            "relay name must not be empty",
                            "Remove the empty entry or name an existing CircuitRelay.",
                        ));
                    } else if name == node_name {
                        errors.push(SpecValidationError::new(
                            format!("spec.relays.named[{i}]"),
                            format!("node '{node_name}' cannot use itself as a circuit relay"),
                            "Reference a CircuitRelay resource, not the Ipfs node itself.",
                        ));
                    }
                }
                if names.len() as u32 > MAX_RELAYS {
                    errors.push(SpecValidationError::new(
                        "spec.relays.named",
                        format!("at most {MAX_RELAYS} relays may be named"),
                        "Reduce the number of named relays.",
                    ));
                }
            }
            Some(RelayRequirement::Pool(pool)) => {
                if pool.count > MAX_RELAYS {
                    errors.push(SpecValidationError::new(
                        "spec.relays.pool.count",
                        format!("count {} exceeds the maximum of {MAX_RELAYS}", pool.count),
                        format!("Set spec.relays.pool.count to {MAX_RELAYS} or fewer."),
                    ));
                }
            }
            None => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn follows(&self) -> &[FollowParams] {
        self.follows.as_deref().unwrap_or_default()
    }

    /// True when the spec asks for at least one circuit relay
    pub fn requires_relays(&self) -> bool {
        self.relays
            .as_ref()
            .map(RelayRequirement::is_required)
            .unwrap_or(false)
    }
}

/// Observed state of an `Ipfs` node
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IpfsStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// Relays currently bound, in binding order
    ///
    /// `None` until relay resolution has run once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_relays: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl IpfsStatus {
    pub fn conditions(&self) -> &[Condition] {
        self.conditions.as_deref().unwrap_or_default()
    }

    pub fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        self.conditions.get_or_insert_with(Vec::new)
    }

    pub fn bound_relays(&self) -> &[String] {
        self.circuit_relays.as_deref().unwrap_or_default()
    }
}
