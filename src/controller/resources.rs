//! Kubernetes resource builders for Ipfs nodes and circuit relays
//!
//! Pure functions that turn a custom resource into the StatefulSets,
//! Deployments, Services, ConfigMaps and Secrets that run it. Applying them
//! is the job of [`super::workload`].

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::core::v1::LoadBalancerIngress;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::crd::{AddrInfo, CircuitRelay, Ipfs, Networking};
use crate::error::Result;

use super::relay_identity::RelayIdentity;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "ipfs-operator";

/// Label marking relays provisioned for a specific node
pub const LABEL_RELAY_FOR: &str = "cluster.ipfs.io/relay-for";

/// Pod annotation carrying the rendered config checksum
pub const ANNOTATION_CONFIG_HASH: &str = "cluster.ipfs.io/config-hash";

pub const SWARM_PORT: i32 = 4001;
pub const API_PORT: i32 = 5001;
pub const GATEWAY_PORT: i32 = 8080;
pub const CLUSTER_API_PORT: i32 = 9094;
pub const CLUSTER_SWARM_PORT: i32 = 9096;

/// Container images used for node and relay workloads
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadImages {
    pub ipfs: String,
    pub cluster: String,
    pub follower: String,
    pub relay: String,
}

impl Default for WorkloadImages {
    fn default() -> Self {
        Self {
            ipfs: "docker.io/ipfs/kubo:v0.29.0".to_string(),
            cluster: "docker.io/ipfs/ipfs-cluster:v1.1.1".to_string(),
            follower: "docker.io/ipfs/ipfs-cluster:v1.1.1".to_string(),
            relay: "ghcr.io/libp2p/go-libp2p-relay-daemon:v0.4.0".to_string(),
        }
    }
}

/// Get the standard labels for a node's resources
pub fn node_labels(node: &Ipfs) -> BTreeMap<String, String> {
    standard_labels("ipfs-node", &node.name_any())
}

/// Get the standard labels for a relay's resources
pub fn relay_labels(relay: &CircuitRelay) -> BTreeMap<String, String> {
    standard_labels("circuit-relay", &relay.name_any())
}

fn standard_labels(component: &str, instance: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "ipfs".to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), instance.to_string());
    labels.insert("app.kubernetes.io/component".to_string(), component.to_string());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );
    labels
}

/// Render a label map as a label selector string
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Create a controlling OwnerReference for garbage collection
pub fn owner_reference<K>(obj: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.meta().name.clone().unwrap_or_default(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Build the resource name for a given component
pub fn resource_name(name: &str, suffix: &str) -> String {
    format!("{name}-{suffix}")
}

fn owned_meta<K>(obj: &K, name: String, labels: BTreeMap<String, String>) -> ObjectMeta
where
    K: Resource<DynamicType = ()>,
{
    ObjectMeta {
        name: Some(name),
        namespace: obj.meta().namespace.clone(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(obj)]),
        ..Default::default()
    }
}

fn tcp_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn udp_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("UDP".to_string()),
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32, protocol: &str) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

// ============================================================================
// Node configuration
// ============================================================================

/// Render the IPFS configuration overlay for a node
///
/// Relay addresses are embedded as static relays; public nodes announce
/// their configured addresses, private nodes rely on relays for reachability.
pub fn render_node_config(node: &Ipfs, relays: &[AddrInfo]) -> serde_json::Value {
    let static_relays: Vec<String> = relays.iter().flat_map(AddrInfo::p2p_addrs).collect();
    let relays_enabled = !static_relays.is_empty();

    let (announce, reachability) = match &node.spec.networking {
        Networking::Public(public) => (public.announce_addresses.clone(), "Public"),
        Networking::Private(_) => (Vec::new(), "Private"),
    };

    json!({
        "Addresses": {
            "Swarm": [
                format!("/ip4/0.0.0.0/tcp/{SWARM_PORT}"),
                format!("/ip4/0.0.0.0/udp/{SWARM_PORT}/quic-v1"),
            ],
            "Announce": announce,
            "API": format!("/ip4/0.0.0.0/tcp/{API_PORT}"),
            "Gateway": format!("/ip4/0.0.0.0/tcp/{GATEWAY_PORT}"),
        },
        "Swarm": {
            "RelayClient": {
                "Enabled": relays_enabled,
                "StaticRelays": static_relays,
            },
            "EnableHolePunching": relays_enabled,
        },
        "Internal": {
            "Libp2pForceReachability": reachability,
        },
    })
}

/// Hex-encoded sha256 of rendered configuration
pub fn config_checksum(config: &str) -> String {
    hex::encode(Sha256::digest(config.as_bytes()))
}

/// Build the ConfigMap holding a node's rendered configuration
pub fn build_node_config_map(node: &Ipfs, config: &str) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert("config.json".to_string(), config.to_string());

    ConfigMap {
        metadata: owned_meta(
            node,
            resource_name(&node.name_any(), "config"),
            node_labels(node),
        ),
        data: Some(data),
        ..Default::default()
    }
}

// ============================================================================
// Node StatefulSet
// ============================================================================

fn volume_claim(name: &str, size: &str, storage_class: Option<&String>) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size.to_string()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class.cloned(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_ipfs_container(images: &WorkloadImages) -> Container {
    Container {
        name: "ipfs".to_string(),
        image: Some(images.ipfs.clone()),
        env: Some(vec![env("IPFS_PROFILE", "server")]),
        ports: Some(vec![
            tcp_port("swarm", SWARM_PORT),
            udp_port("swarm-udp", SWARM_PORT),
            tcp_port("api", API_PORT),
            tcp_port("gateway", GATEWAY_PORT),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "ipfs-storage".to_string(),
                mount_path: "/data/ipfs".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "config".to_string(),
                mount_path: "/container-init.d/overlay".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn build_cluster_container(node: &Ipfs, images: &WorkloadImages) -> Container {
    Container {
        name: "ipfs-cluster".to_string(),
        image: Some(images.cluster.clone()),
        env: Some(vec![
            env("CLUSTER_PEERNAME", node.name_any()),
            env("CLUSTER_IPFSHTTP_NODEMULTIADDRESS", format!("/ip4/127.0.0.1/tcp/{API_PORT}")),
            env("CLUSTER_RESTAPI_HTTPLISTENMULTIADDRESS", format!("/ip4/0.0.0.0/tcp/{CLUSTER_API_PORT}")),
            env("CLUSTER_MONITORPINGINTERVAL", "2s"),
        ]),
        ports: Some(vec![
            tcp_port("cluster-api", CLUSTER_API_PORT),
            tcp_port("cluster-swarm", CLUSTER_SWARM_PORT),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "cluster-storage".to_string(),
            mount_path: "/data/ipfs-cluster".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn build_follower_container(images: &WorkloadImages) -> Container {
    Container {
        name: "follower".to_string(),
        image: Some(images.follower.clone()),
        command: Some(vec!["/usr/local/bin/ipfs-cluster-follow-runner".to_string()]),
        env: Some(vec![
            env("FOLLOW_SESSIONS_DIR", "/follows"),
            env("IPFS_API", format!("/ip4/127.0.0.1/tcp/{API_PORT}")),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "follows".to_string(),
            mount_path: "/follows".to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Build the StatefulSet running a node
///
/// `config_hash` lands on the pod template so configuration changes
/// (e.g. a new relay set) roll the pods.
pub fn build_node_statefulset(node: &Ipfs, images: &WorkloadImages, config_hash: &str) -> StatefulSet {
    let labels = node_labels(node);
    let name = node.name_any();

    let mut containers = vec![build_ipfs_container(images), build_cluster_container(node, images)];
    let mut volumes = vec![Volume {
        name: "config".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(resource_name(&name, "config")),
            ..Default::default()
        }),
        ..Default::default()
    }];
    if !node.spec.follows().is_empty() {
        containers.push(build_follower_container(images));
        volumes.push(Volume {
            name: "follows".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(resource_name(&name, "follows")),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let mut pod_annotations = BTreeMap::new();
    pod_annotations.insert(ANNOTATION_CONFIG_HASH.to_string(), config_hash.to_string());

    let storage = &node.spec.storage;

    StatefulSet {
        metadata: owned_meta(node, name.clone(), labels.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(node.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            service_name: name.clone(),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![
                volume_claim("ipfs-storage", &storage.ipfs_size, storage.storage_class.as_ref()),
                volume_claim(
                    "cluster-storage",
                    &storage.cluster_size,
                    storage.storage_class.as_ref(),
                ),
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Node Services
// ============================================================================

/// Build the cluster-internal Service for API, gateway and cluster traffic
pub fn build_node_service(node: &Ipfs) -> Service {
    let labels = node_labels(node);
    let mut ports = vec![
        service_port("api", API_PORT, "TCP"),
        service_port("gateway", GATEWAY_PORT, "TCP"),
        service_port("cluster-api", CLUSTER_API_PORT, "TCP"),
        service_port("cluster-swarm", CLUSTER_SWARM_PORT, "TCP"),
    ];
    if let Networking::Private(_) = node.spec.networking {
        ports.push(service_port("swarm", SWARM_PORT, "TCP"));
        ports.push(service_port("swarm-udp", SWARM_PORT, "UDP"));
    }

    Service {
        metadata: owned_meta(node, node.name_any(), labels.clone()),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

/// Name of the externally routable swarm Service of a public node
pub fn swarm_service_name(node: &Ipfs) -> String {
    resource_name(&node.name_any(), "swarm")
}

/// Build the externally routable swarm Service for a public node
///
/// Returns `None` for private nodes, whose swarm port stays cluster-internal.
pub fn build_swarm_service(node: &Ipfs) -> Option<Service> {
    let Networking::Public(public) = &node.spec.networking else {
        return None;
    };
    let labels = node_labels(node);

    Some(Service {
        metadata: owned_meta(node, swarm_service_name(node), labels.clone()),
        spec: Some(ServiceSpec {
            type_: Some(public.service_type.to_string()),
            external_traffic_policy: Some("Local".to_string()),
            selector: Some(labels),
            ports: Some(vec![
                service_port("swarm", SWARM_PORT, "TCP"),
                service_port("swarm-udp", SWARM_PORT, "UDP"),
            ]),
            ..Default::default()
        }),
        status: None,
    })
}

// ============================================================================
// Relay workload
// ============================================================================

/// Name of the Secret holding a relay's libp2p identity
pub fn relay_identity_secret_name(relay: &CircuitRelay) -> String {
    resource_name(&relay.name_any(), "identity")
}

/// Build the identity Secret for a relay
pub fn build_relay_identity_secret(
    relay: &CircuitRelay,
    identity: &RelayIdentity,
) -> Result<Secret> {
    let mut data = BTreeMap::new();
    data.insert(
        "identity.key".to_string(),
        ByteString(identity.private_key_protobuf()?),
    );
    data.insert(
        "identity.json".to_string(),
        ByteString(identity.config_json()?.into_bytes()),
    );

    Ok(Secret {
        metadata: owned_meta(
            relay,
            relay_identity_secret_name(relay),
            relay_labels(relay),
        ),
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

/// Build the Deployment running a relay daemon
pub fn build_relay_deployment(relay: &CircuitRelay, images: &WorkloadImages) -> Deployment {
    let labels = relay_labels(relay);
    let name = relay.name_any();

    Deployment {
        metadata: owned_meta(relay, name.clone(), labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "relay".to_string(),
                        image: Some(images.relay.clone()),
                        args: Some(vec![
                            "-id".to_string(),
                            "/identity/identity.key".to_string(),
                        ]),
                        ports: Some(vec![
                            tcp_port("swarm", SWARM_PORT),
                            udp_port("swarm-udp", SWARM_PORT),
                        ]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "identity".to_string(),
                            mount_path: "/identity".to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "identity".to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(relay_identity_secret_name(relay)),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the LoadBalancer Service exposing a relay
pub fn build_relay_service(relay: &CircuitRelay) -> Service {
    let labels = relay_labels(relay);

    Service {
        metadata: owned_meta(relay, relay.name_any(), labels.clone()),
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            selector: Some(labels),
            ports: Some(vec![
                service_port("swarm", SWARM_PORT, "TCP"),
                service_port("swarm-udp", SWARM_PORT, "UDP"),
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Multiaddrs reachable through a LoadBalancer's ingress points
pub fn ingress_multiaddrs(ingress: &[LoadBalancerIngress]) -> Vec<String> {
    let mut addrs = Vec::new();
    for point in ingress {
        let host = match (&point.ip, &point.hostname) {
            (Some(ip), _) if ip.contains(':') => format!("/ip6/{ip}"),
            (Some(ip), _) => format!("/ip4/{ip}"),
            (None, Some(hostname)) => format!("/dns4/{hostname}"),
            (None, None) => continue,
        };
        addrs.push(format!("{host}/tcp/{SWARM_PORT}"));
        addrs.push(format!("{host}/udp/{SWARM_PORT}/quic-v1"));
    }
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ExposureType, FollowParams, IpfsSpec, PrivateNetworking, PublicNetworking};

    fn node(networking: Networking) -> Ipfs {
        let mut node = Ipfs::new(
            "node-a",
            IpfsSpec {
                networking,
                ..Default::default()
            },
        );
        node.metadata.namespace = Some("default".to_string());
        node.metadata.uid = Some("uid-node-a".to_string());
        node
    }

    fn relay_info(id: &str) -> AddrInfo {
        AddrInfo {
            id: id.to_string(),
            addrs: vec!["/ip4/203.0.113.7/tcp/4001".to_string()],
        }
    }

    #[test]
    fn test_private_node_has_no_external_service() {
        let node = node(Networking::Private(PrivateNetworking {}));
        assert!(build_swarm_service(&node).is_none());

        let internal = build_node_service(&node);
        let spec = internal.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert!(spec
            .ports
            .unwrap()
            .iter()
            .any(|p| p.name.as_deref() == Some("swarm")));
    }

    #[test]
    fn test_public_node_exposes_swarm_only() {
        let node = node(Networking::Public(PublicNetworking {
            service_type: ExposureType::NodePort,
            announce_addresses: vec![],
        }));
        let swarm = build_swarm_service(&node).expect("public node has a swarm service");
        let spec = swarm.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|p| p.port == SWARM_PORT));

        let internal = build_node_service(&node).spec.unwrap().ports.unwrap();
        assert!(internal.iter().all(|p| p.port != SWARM_PORT));
    }

    #[test]
    fn test_config_embeds_relays() {
        let node = node(Networking::default());
        let config = render_node_config(&node, &[relay_info("12D3KooWr1")]);
        assert_eq!(config["Swarm"]["RelayClient"]["Enabled"], json!(true));
        assert_eq!(
            config["Swarm"]["RelayClient"]["StaticRelays"],
            json!(["/ip4/203.0.113.7/tcp/4001/p2p/12D3KooWr1"])
        );
        assert_eq!(config["Internal"]["Libp2pForceReachability"], json!("Private"));

        let without = render_node_config(&node, &[]);
        assert_eq!(without["Swarm"]["RelayClient"]["Enabled"], json!(false));
    }

    #[test]
    fn test_config_hash_changes_with_relays() {
        let node = node(Networking::default());
        let a = render_node_config(&node, &[relay_info("12D3KooWr1")]).to_string();
        let b = render_node_config(&node, &[relay_info("12D3KooWr2")]).to_string();
        assert_ne!(config_checksum(&a), config_checksum(&b));
        assert_eq!(config_checksum(&a), config_checksum(&a));
    }

    #[test]
    fn test_statefulset_shape() {
        let mut node = node(Networking::default());
        node.spec.replicas = 3;
        let sts = build_node_statefulset(&node, &WorkloadImages::default(), "abc");
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.volume_claim_templates.unwrap().len(), 2);

        let template = spec.template;
        let annotations = template.metadata.unwrap().annotations.unwrap();
        assert_eq!(annotations.get(ANNOTATION_CONFIG_HASH), Some(&"abc".to_string()));
        let containers = template.spec.unwrap().containers;
        assert_eq!(containers.len(), 2, "no follower sidecar without follows");

        assert_eq!(
            sts.metadata.owner_references.unwrap()[0].uid,
            "uid-node-a".to_string()
        );
    }

    #[test]
    fn test_follower_sidecar_added_with_follows() {
        let mut node = node(Networking::default());
        node.spec.follows = Some(vec![FollowParams {
            name: "collab".to_string(),
            template: "https://collab.example.org/service.json".to_string(),
            policy: Default::default(),
        }]);
        let sts = build_node_statefulset(&node, &WorkloadImages::default(), "abc");
        let pod = sts.spec.unwrap().template.spec.unwrap();
        assert!(pod.containers.iter().any(|c| c.name == "follower"));
        assert!(pod.volumes.unwrap().iter().any(|v| v.name == "follows"));
    }

    #[test]
    fn test_ingress_multiaddrs() {
        let ingress = vec![
            LoadBalancerIngress {
                ip: Some("203.0.113.9".to_string()),
                ..Default::default()
            },
            LoadBalancerIngress {
                hostname: Some("relay.example.org".to_string()),
                ..Default::default()
            },
        ];
        assert_eq!(
            ingress_multiaddrs(&ingress),
            vec![
                "/ip4/203.0.113.9/tcp/4001",
                "/ip4/203.0.113.9/udp/4001/quic-v1",
                "/dns4/relay.example.org/tcp/4001",
                "/dns4/relay.example.org/udp/4001/quic-v1",
            ]
        );
        assert!(ingress_multiaddrs(&[LoadBalancerIngress::default()]).is_empty());
    }
}
