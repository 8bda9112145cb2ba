//! Workload runtime backed by Kubernetes objects
//!
//! Applies the objects built in [`super::resources`] with server-side apply
//! and reads health back from their status.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::crd::{AddrInfo, CircuitRelay, Ipfs};
use crate::error::{Error, Result};

use super::relay_identity::RelayIdentity;
use super::resources::{
    build_node_config_map, build_node_service, build_node_statefulset, build_relay_deployment,
    build_relay_identity_secret, build_relay_service, build_swarm_service, config_checksum,
    ingress_multiaddrs, label_selector, node_labels, relay_identity_secret_name, render_node_config,
    resource_name, swarm_service_name, WorkloadImages, FIELD_MANAGER,
};
use super::runtime::{RelayWorkload, WorkloadHealth, WorkloadRuntime};

/// Container waiting reasons that will not resolve without intervention
const FAILING_REASONS: [&str; 4] = [
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
];

#[derive(Clone)]
pub struct KubeWorkloadRuntime {
    client: Client,
    images: WorkloadImages,
}

impl KubeWorkloadRuntime {
    pub fn new(client: Client, images: WorkloadImages) -> Self {
        Self { client, images }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn pod_failure(&self, namespace: &str, selector: &str) -> Result<Option<String>> {
        let pods: Api<Pod> = self.api(namespace);
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        for pod in list.items {
            let statuses = pod
                .status
                .and_then(|s| s.container_statuses)
                .unwrap_or_default();
            for status in statuses {
                let waiting = status.state.and_then(|s| s.waiting);
                if let Some(reason) = waiting.and_then(|w| w.reason) {
                    if FAILING_REASONS.contains(&reason.as_str()) {
                        return Ok(Some(format!(
                            "container {} in pod {} is {}",
                            status.name,
                            pod.metadata.name.unwrap_or_default(),
                            reason
                        )));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn relay_identity(&self, relay: &CircuitRelay, namespace: &str) -> Result<RelayIdentity> {
        let secrets: Api<Secret> = self.api(namespace);
        let name = relay_identity_secret_name(relay);

        let secret = match secrets.get_opt(&name).await? {
            Some(secret) => secret,
            None => {
                let identity = RelayIdentity::generate();
                let secret = build_relay_identity_secret(relay, &identity)?;
                match secrets.create(&PostParams::default(), &secret).await {
                    Ok(_) => {
                        info!("Generated identity {} for relay {}", identity.peer_id(), relay.name_any());
                        return Ok(identity);
                    }
                    // lost a race with a concurrent pass; use whatever was stored
                    Err(kube::Error::Api(e)) if e.code == 409 => secrets.get(&name).await?,
                    Err(e) => return Err(Error::KubeError(e)),
                }
            }
        };

        let key = secret
            .data
            .as_ref()
            .and_then(|d| d.get("identity.key"))
            .ok_or_else(|| Error::ConfigError(format!("secret {name} has no identity.key")))?;
        RelayIdentity::from_protobuf(&key.0)
    }
}

async fn apply<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::ConfigError("object to apply has no name".to_string()))?;
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(obj))
        .await?;
    Ok(())
}

async fn delete_if_present<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => info!("Deleted {} {}", K::kind(&()), name),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!("{} {} already deleted", K::kind(&()), name);
        }
        Err(e) => return Err(Error::KubeError(e)),
    }
    Ok(())
}

#[async_trait]
impl WorkloadRuntime for KubeWorkloadRuntime {
    #[instrument(skip(self, node, relays), fields(name = %node.name_any(), namespace = node.namespace()))]
    async fn ensure_node_workload(&self, node: &Ipfs, relays: &[AddrInfo]) -> Result<WorkloadHealth> {
        let namespace = node.namespace().unwrap_or_else(|| "default".to_string());
        let name = node.name_any();

        let config = serde_json::to_string_pretty(&render_node_config(node, relays))?;
        let checksum = config_checksum(&config);

        apply(&self.api::<ConfigMap>(&namespace), &build_node_config_map(node, &config)).await?;
        apply(&self.api::<Service>(&namespace), &build_node_service(node)).await?;

        let services: Api<Service> = self.api(&namespace);
        match build_swarm_service(node) {
            Some(swarm) => apply(&services, &swarm).await?,
            None => delete_if_present(&services, &swarm_service_name(node)).await?,
        }

        let statefulsets: Api<StatefulSet> = self.api(&namespace);
        apply(
            &statefulsets,
            &build_node_statefulset(node, &self.images, &checksum),
        )
        .await?;

        let observed = statefulsets.get(&name).await?;
        let desired = node.spec.replicas;
        let ready = observed
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        let updated = observed
            .status
            .as_ref()
            .and_then(|s| s.updated_replicas)
            .unwrap_or(0);

        if ready >= desired && updated >= desired {
            return Ok(WorkloadHealth::Healthy);
        }

        if let Some(message) = self
            .pod_failure(&namespace, &label_selector(&node_labels(node)))
            .await?
        {
            warn!("Node {} workload failing: {}", name, message);
            return Ok(WorkloadHealth::Failing { message });
        }

        Ok(WorkloadHealth::Provisioning {
            message: format!("{ready}/{desired} replicas ready"),
        })
    }

    #[instrument(skip(self, node), fields(name = %node.name_any(), namespace = node.namespace()))]
    async fn release_node_workload(&self, node: &Ipfs) -> Result<()> {
        let namespace = node.namespace().unwrap_or_else(|| "default".to_string());
        let name = node.name_any();

        delete_if_present(&self.api::<StatefulSet>(&namespace), &name).await?;
        let services: Api<Service> = self.api(&namespace);
        delete_if_present(&services, &swarm_service_name(node)).await?;
        delete_if_present(&services, &name).await?;
        delete_if_present(&self.api::<ConfigMap>(&namespace), &resource_name(&name, "config"))
            .await?;

        // Volume claims from the StatefulSet template are kept so data survives re-creation
        Ok(())
    }

    #[instrument(skip(self, relay), fields(name = %relay.name_any(), namespace = relay.namespace()))]
    async fn ensure_relay_workload(&self, relay: &CircuitRelay) -> Result<RelayWorkload> {
        let namespace = relay.namespace().unwrap_or_else(|| "default".to_string());
        let name = relay.name_any();

        let identity = self.relay_identity(relay, &namespace).await?;

        let deployments: Api<Deployment> = self.api(&namespace);
        apply(&deployments, &build_relay_deployment(relay, &self.images)).await?;
        let services: Api<Service> = self.api(&namespace);
        apply(&services, &build_relay_service(relay)).await?;

        let ready = deployments
            .get(&name)
            .await?
            .status
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);

        let ingress = services
            .get(&name)
            .await?
            .status
            .and_then(|s| s.load_balancer)
            .and_then(|lb| lb.ingress)
            .unwrap_or_default();

        let addr_info = AddrInfo {
            id: identity.peer_id(),
            addrs: ingress_multiaddrs(&ingress),
        };

        Ok(RelayWorkload {
            healthy: ready > 0,
            addr_info: addr_info.is_complete().then_some(addr_info),
        })
    }

    #[instrument(skip(self, relay), fields(name = %relay.name_any(), namespace = relay.namespace()))]
    async fn release_relay_workload(&self, relay: &CircuitRelay) -> Result<()> {
        let namespace = relay.namespace().unwrap_or_else(|| "default".to_string());
        let name = relay.name_any();

        delete_if_present(&self.api::<Deployment>(&namespace), &name).await?;
        delete_if_present(&self.api::<Service>(&namespace), &name).await?;
        delete_if_present(
            &self.api::<Secret>(&namespace),
            &relay_identity_secret_name(relay),
        )
        .await?;
        Ok(())
    }
}
