//! Controller module for Ipfs and CircuitRelay reconciliation
//!
//! Contains the two controller loops, the pure planning logic they share
//! (relay resolution, follow planning, readiness aggregation) and the
//! Kubernetes-backed collaborators they act through.

mod backoff;
pub mod conditions;
mod context;
mod finalizers;
pub mod follow_sessions;
pub mod follow_sync;
pub mod kube_store;
#[cfg(feature = "metrics")]
pub mod metrics;
mod node_reconciler;
pub mod relay_identity;
mod relay_reconciler;
pub mod relay_resolver;
pub mod resources;
pub mod runtime;
#[cfg(test)]
mod testing;
pub mod workload;

pub use backoff::{calculate_backoff, RetryTracker};
pub use context::{requeue_for_error, scoped_api, Context, ControllerState, ReconcileConfig};
pub use finalizers::{CIRCUIT_RELAY_FINALIZER, IPFS_FINALIZER};
pub use follow_sessions::ConfigMapFollowSessions;
pub use kube_store::KubeStore;
pub use node_reconciler::{
    aggregate_readiness, apply_node, cleanup_node, nodes_for_relay, run_node_controller, Readiness,
};
pub use relay_reconciler::{apply_relay, cleanup_relay, run_relay_controller};
pub use resources::WorkloadImages;
pub use runtime::{
    FollowSession, FollowSessionProvider, RelayWorkload, ResourceStore, WorkloadHealth,
    WorkloadRuntime,
};
pub use workload::KubeWorkloadRuntime;
