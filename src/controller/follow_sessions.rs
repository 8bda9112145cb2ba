//! Follow sessions stored in a per-node ConfigMap
//!
//! The follower sidecar mounts `<node>-follows` and runs one
//! `ipfs-cluster-follow` session per entry. Each key is the follow name and
//! each value a JSON document with the normalized target and sync policy.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::crd::{Ipfs, SyncPolicy};
use crate::error::{Error, Result};

use super::resources::{node_labels, owner_reference, resource_name, FIELD_MANAGER};
use super::runtime::{FollowSession, FollowSessionProvider};

#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    target: String,
    policy: SyncPolicy,
}

#[derive(Clone)]
pub struct ConfigMapFollowSessions {
    client: Client,
}

impl ConfigMapFollowSessions {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, node: &Ipfs) -> Api<ConfigMap> {
        let namespace = node.namespace().unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }

    async fn load(&self, node: &Ipfs) -> Result<BTreeMap<String, String>> {
        let cm = self
            .api(node)
            .get_opt(&follows_config_map_name(node))
            .await?;
        Ok(cm.and_then(|cm| cm.data).unwrap_or_default())
    }

    async fn store(&self, node: &Ipfs, data: BTreeMap<String, String>) -> Result<()> {
        let name = follows_config_map_name(node);
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: node.namespace(),
                labels: Some(node_labels(node)),
                owner_references: Some(vec![owner_reference(node)]),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        self.api(node)
            .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&cm))
            .await
            .map_err(|e| Error::from_kube(e, format!("configmap {name}")))?;
        Ok(())
    }
}

pub fn follows_config_map_name(node: &Ipfs) -> String {
    resource_name(&node.name_any(), "follows")
}

fn decode(entries: BTreeMap<String, String>) -> Vec<FollowSession> {
    entries
        .into_iter()
        .filter_map(|(name, value)| match serde_json::from_str::<StoredSession>(&value) {
            Ok(stored) => Some(FollowSession {
                name,
                target: stored.target,
                policy: stored.policy,
            }),
            Err(e) => {
                warn!("Ignoring unreadable follow session {}: {}", name, e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl FollowSessionProvider for ConfigMapFollowSessions {
    async fn established(&self, node: &Ipfs) -> Result<Vec<FollowSession>> {
        Ok(decode(self.load(node).await?))
    }

    #[instrument(skip(self, node, session), fields(name = %node.name_any(), follow = %session.name))]
    async fn create(&self, node: &Ipfs, session: &FollowSession) -> Result<()> {
        let mut data = self.load(node).await?;
        let value = serde_json::to_string(&StoredSession {
            target: session.target.clone(),
            policy: session.policy.clone(),
        })?;
        data.insert(session.name.clone(), value);
        self.store(node, data).await?;
        info!("Started follow session {} -> {}", session.name, session.target);
        Ok(())
    }

    #[instrument(skip(self, node), fields(name = %node.name_any()))]
    async fn remove(&self, node: &Ipfs, target: &str) -> Result<()> {
        let data = self.load(node).await?;
        let before = data.len();
        let kept: BTreeMap<String, String> = data
            .into_iter()
            .filter(|(_, value)| {
                serde_json::from_str::<StoredSession>(value)
                    .map(|s| s.target != target)
                    .unwrap_or(false)
            })
            .collect();
        if kept.len() != before {
            self.store(node, kept).await?;
            info!("Stopped follow session for {}", target);
        }
        Ok(())
    }

    async fn clear(&self, node: &Ipfs) -> Result<()> {
        let name = follows_config_map_name(node);
        match self.api(node).delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!("Deleted follow sessions {}", name),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("Follow sessions {} already gone", name);
            }
            Err(e) => return Err(Error::KubeError(e)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_skips_garbage() {
        let mut data = BTreeMap::new();
        data.insert(
            "collab".to_string(),
            r#"{"target":"https://collab.example.org","policy":{"type":"continuous"}}"#.to_string(),
        );
        data.insert("broken".to_string(), "not json".to_string());

        let sessions = decode(data);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "collab");
        assert_eq!(sessions[0].target, "https://collab.example.org");
        assert_eq!(sessions[0].policy, SyncPolicy::Continuous);
    }

    #[test]
    fn test_periodic_policy_encoding() {
        let stored = StoredSession {
            target: "collab".to_string(),
            policy: SyncPolicy::Periodic {
                interval_seconds: 600,
            },
        };
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["policy"]["type"], "periodic");
        assert_eq!(json["policy"]["intervalSeconds"], 600);
    }
}
