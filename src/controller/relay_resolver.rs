//! Circuit relay resolution
//!
//! Turns a node's [`RelayRequirement`] plus the `CircuitRelay` objects that
//! currently exist into the ordered list of relay names the node is bound to.
//! Resolution is a pure function over a snapshot: it never waits, it reports
//! which slots are still pending so the caller can requeue.

use std::collections::{BTreeMap, HashSet};

use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::crd::{AddrInfo, CircuitRelay, CircuitRelaySpec, Ipfs, RelayPool, RelayRequirement};

use super::resources::{owner_reference, LABEL_RELAY_FOR};

/// Why a named relay could not be bound yet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingReason {
    /// No `CircuitRelay` with that name exists
    Missing,
    /// The relay exists but has not published a complete address
    Unresolved,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRelay {
    pub name: String,
    pub reason: PendingReason,
}

/// Outcome of one resolution pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayResolution {
    /// Whether the spec asks for any relay at all
    pub required: bool,
    /// Names to publish in `status.circuitRelays`, in binding order
    pub bound: Vec<String>,
    /// Addresses of the bound relays that are currently live, in binding order
    pub addr_infos: Vec<AddrInfo>,
    /// Named relays that cannot be bound yet
    pub pending: Vec<PendingRelay>,
    /// Bound relays that have since disappeared or lost their address
    pub stale: Vec<String>,
    /// Pool slots with no ready candidate
    pub shortfall: u32,
}

impl RelayResolution {
    /// All requested slots are filled
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.shortfall == 0
    }

    /// Complete, and every bound relay still has a published address
    pub fn is_healthy(&self) -> bool {
        self.is_complete() && self.stale.is_empty()
    }

    /// Human-readable summary for the `RelayBound` condition
    pub fn summary(&self) -> String {
        if !self.required {
            return "No circuit relays required".to_string();
        }
        let mut parts = vec![format!("{} relay(s) bound", self.bound.len())];
        if !self.pending.is_empty() {
            let names: Vec<String> = self
                .pending
                .iter()
                .map(|p| match p.reason {
                    PendingReason::Missing => format!("{} (missing)", p.name),
                    PendingReason::Unresolved => format!("{} (awaiting address)", p.name),
                })
                .collect();
            parts.push(format!("pending: {}", names.join(", ")));
        }
        if self.shortfall > 0 {
            parts.push(format!("{} more ready relay(s) needed", self.shortfall));
        }
        if !self.stale.is_empty() {
            parts.push(format!("unavailable: {}", self.stale.join(", ")));
        }
        parts.join("; ")
    }
}

/// True when the relay carries every label in `selector`
pub fn matches_selector(relay: &CircuitRelay, selector: &BTreeMap<String, String>) -> bool {
    let labels = relay.labels();
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

fn find<'a>(relays: &'a [CircuitRelay], name: &str) -> Option<&'a CircuitRelay> {
    relays.iter().find(|r| r.name_any() == name)
}

/// Resolve a relay requirement against the relays that exist right now
///
/// `sticky` holds names bound by an earlier pass for the same spec
/// generation. They stay bound even if their relay is gone or unready;
/// such names are reported in [`RelayResolution::stale`] and are only
/// dropped when the spec changes.
pub fn resolve_relays(
    requirement: Option<&RelayRequirement>,
    relays: &[CircuitRelay],
    sticky: &[String],
) -> RelayResolution {
    let requirement = match requirement {
        Some(r) if r.is_required() => r,
        _ => return RelayResolution::default(),
    };

    let mut resolution = RelayResolution {
        required: true,
        ..Default::default()
    };

    match requirement {
        RelayRequirement::Named(names) => {
            let mut seen = HashSet::new();
            for name in names.iter().filter(|n| seen.insert(n.as_str())) {
                let relay = find(relays, name);
                let addr = relay.and_then(|r| r.resolved_addr_info());
                match addr {
                    Some(info) => {
                        resolution.bound.push(name.clone());
                        resolution.addr_infos.push(info.clone());
                    }
                    None if sticky.contains(name) => {
                        resolution.bound.push(name.clone());
                        resolution.stale.push(name.clone());
                    }
                    None => resolution.pending.push(PendingRelay {
                        name: name.clone(),
                        reason: if relay.is_some() {
                            PendingReason::Unresolved
                        } else {
                            PendingReason::Missing
                        },
                    }),
                }
            }
        }
        RelayRequirement::Pool(pool) => {
            let count = pool.count as usize;
            let mut seen = HashSet::new();

            for name in sticky.iter().filter(|n| seen.insert(n.as_str())).take(count) {
                resolution.bound.push(name.clone());
                match find(relays, name).and_then(|r| r.resolved_addr_info()) {
                    Some(info) => resolution.addr_infos.push(info.clone()),
                    None => resolution.stale.push(name.clone()),
                }
            }

            let mut candidates: Vec<&CircuitRelay> = relays
                .iter()
                .filter(|r| matches_selector(r, &pool.selector))
                .filter(|r| r.resolved_addr_info().is_some())
                .collect();
            candidates.sort_by_key(|r| r.name_any());

            for relay in candidates {
                if resolution.bound.len() >= count {
                    break;
                }
                let name = relay.name_any();
                if resolution.bound.contains(&name) {
                    continue;
                }
                if let Some(info) = relay.resolved_addr_info() {
                    resolution.addr_infos.push(info.clone());
                }
                resolution.bound.push(name);
            }

            resolution.shortfall = count.saturating_sub(resolution.bound.len()) as u32;
        }
    }

    resolution
}

/// Names of relays to create so the pool has `count` candidates
///
/// Existing candidates count whether or not they are ready yet, so a pass
/// never provisions twice for relays that are still starting.
pub fn relays_to_provision(node_name: &str, pool: &RelayPool, relays: &[CircuitRelay]) -> Vec<String> {
    if !pool.provision {
        return Vec::new();
    }
    let candidates = relays
        .iter()
        .filter(|r| matches_selector(r, &pool.selector))
        .count();
    let missing = (pool.count as usize).saturating_sub(candidates);

    let existing: HashSet<String> = relays.iter().map(|r| r.name_any()).collect();
    (0..)
        .map(|i| format!("{node_name}-relay-{i}"))
        .filter(|name| !existing.contains(name))
        .take(missing)
        .collect()
}

/// Build a `CircuitRelay` provisioned on behalf of `node`
///
/// The relay carries the pool selector labels so it becomes a candidate,
/// and a non-controlling owner reference so it is collected with the node.
pub fn build_provisioned_relay(node: &Ipfs, name: &str, pool: &RelayPool) -> CircuitRelay {
    let mut labels = pool.selector.clone();
    labels.insert(LABEL_RELAY_FOR.to_string(), node.name_any());

    let mut owner = owner_reference(node);
    owner.controller = Some(false);
    owner.block_owner_deletion = Some(false);

    CircuitRelay {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: node.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: CircuitRelaySpec {},
        status: None,
    }
}
