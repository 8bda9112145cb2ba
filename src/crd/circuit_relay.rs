//! CircuitRelay Custom Resource Definition
//!
//! A `CircuitRelay` is a marker resource: its existence declares that a
//! libp2p circuit relay should run. Once the relay is reachable its peer
//! identity and addresses are published in `status.addrInfo`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AddrInfo, Condition};

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.ipfs.io",
    version = "v1alpha1",
    kind = "CircuitRelay",
    namespaced,
    derive = "PartialEq",
    derive = "Default",
    status = "CircuitRelayStatus",
    shortname = "relay",
    printcolumn = r#"{"name":"PeerID","type":"string","jsonPath":".status.addrInfo.id"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CircuitRelaySpec {}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CircuitRelayStatus {
    /// Resolved identity; absent until the relay has been observed healthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr_info: Option<AddrInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl CircuitRelayStatus {
    pub fn conditions(&self) -> &[Condition] {
        self.conditions.as_deref().unwrap_or_default()
    }

    pub fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        self.conditions.get_or_insert_with(Vec::new)
    }
}

impl CircuitRelay {
    /// The published identity, if it is complete
    pub fn resolved_addr_info(&self) -> Option<&AddrInfo> {
        self.status
            .as_ref()
            .and_then(|s| s.addr_info.as_ref())
            .filter(|info| info.is_complete())
    }
}
