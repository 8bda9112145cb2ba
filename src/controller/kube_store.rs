//! Resource store backed by the Kubernetes API server

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::crd::{CircuitRelay, CircuitRelayStatus, Ipfs, IpfsStatus};
use crate::error::{Error, Result};

use super::resources::FIELD_MANAGER;
use super::runtime::ResourceStore;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Merge patch that only applies if `resourceVersion` still matches
fn conditional_status_patch<S: serde::Serialize>(
    resource_version: Option<String>,
    status: &S,
) -> serde_json::Value {
    json!({
        "metadata": { "resourceVersion": resource_version },
        "status": status,
    })
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn list_relays(&self, namespace: &str) -> Result<Vec<CircuitRelay>> {
        let api: Api<CircuitRelay> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_relay(&self, relay: &CircuitRelay) -> Result<()> {
        let namespace = relay.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<CircuitRelay> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), relay).await {
            Ok(_) => info!("Created CircuitRelay {}/{}", namespace, relay.name_any()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("CircuitRelay {} already exists", relay.name_any());
            }
            Err(e) => return Err(Error::KubeError(e)),
        }
        Ok(())
    }

    async fn update_node_status(&self, node: &Ipfs, status: &IpfsStatus) -> Result<()> {
        let namespace = node.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Ipfs> = Api::namespaced(self.client.clone(), &namespace);
        let patch = conditional_status_patch(node.resource_version(), status);
        api.patch_status(
            &node.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| Error::from_kube(e, format!("ipfs {}/{}", namespace, node.name_any())))?;
        Ok(())
    }

    async fn update_relay_status(
        &self,
        relay: &CircuitRelay,
        status: &CircuitRelayStatus,
    ) -> Result<()> {
        let namespace = relay.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<CircuitRelay> = Api::namespaced(self.client.clone(), &namespace);
        let patch = conditional_status_patch(relay.resource_version(), status);
        api.patch_status(
            &relay.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| {
            Error::from_kube(e, format!("circuitrelay {}/{}", namespace, relay.name_any()))
        })?;
        Ok(())
    }
}
