//! Shared reconcile context
//!
//! Everything a reconcile pass needs is reached through [`Context`]; there is
//! no global state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Api, Client, Resource};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

use super::backoff::{calculate_backoff, RetryTracker};
use super::runtime::{FollowSessionProvider, ResourceStore, WorkloadRuntime};

/// Requeue intervals and retry bounds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Periodic resync of resources that are ready
    pub ready_resync: Duration,
    /// Requeue while a workload is still coming up
    pub progressing_requeue: Duration,
    pub transient_backoff_base: Duration,
    pub transient_backoff_max: Duration,
    /// Backoff while waiting for relays to become available
    pub relay_backoff_base: Duration,
    pub relay_backoff_max: Duration,
    /// Consecutive transient failures before `Degraded` is raised
    pub max_transient_attempts: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            ready_resync: Duration::from_secs(300),
            progressing_requeue: Duration::from_secs(15),
            transient_backoff_base: Duration::from_secs(15),
            transient_backoff_max: Duration::from_secs(300),
            relay_backoff_base: Duration::from_secs(5),
            relay_backoff_max: Duration::from_secs(60),
            max_transient_attempts: 5,
        }
    }
}

impl ReconcileConfig {
    pub fn transient_backoff(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.transient_backoff_base, self.transient_backoff_max)
    }

    pub fn relay_backoff(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.relay_backoff_base, self.relay_backoff_max)
    }
}

pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub runtime: Arc<dyn WorkloadRuntime>,
    pub follows: Arc<dyn FollowSessionProvider>,
    pub config: ReconcileConfig,
    pub retries: RetryTracker,
    shutdown: Arc<AtomicBool>,
    leader: Arc<AtomicBool>,
}

impl Context {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        runtime: Arc<dyn WorkloadRuntime>,
        follows: Arc<dyn FollowSessionProvider>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            follows,
            config,
            retries: RetryTracker::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            leader: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Share an externally managed leadership flag
    pub fn with_leader_flag(mut self, leader: Arc<AtomicBool>) -> Self {
        self.leader = leader;
        self
    }

    pub fn with_shutdown_flag(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Called before every external call; abandons the pass once shutdown
    /// has been requested
    pub fn checkpoint(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// State handed to the kube-rs controllers
pub struct ControllerState {
    pub client: Client,
    pub context: Arc<Context>,
}

/// Api for `K` restricted to `namespace`, or cluster-wide when unset
pub fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Requeue decision for a failed reconcile pass
///
/// Write conflicts are retried after a second against a fresh read. Other
/// transient errors back off per object.
pub fn requeue_for_error(ctx: &Context, key: &str, error: &Error) -> Action {
    match error {
        Error::Cancelled => {
            debug!("Reconcile of {} cancelled", key);
            Action::await_change()
        }
        Error::Conflict(what) => {
            debug!("Status write conflict on {}, recomputing", what);
            Action::requeue(Duration::from_secs(1))
        }
        e if e.is_retriable() => {
            let attempt = ctx.retries.bump(key);
            let delay = ctx.config.transient_backoff(attempt);
            warn!("Reconcile of {} failed (attempt {}), retrying in {:?}: {}", key, attempt + 1, delay, e);
            Action::requeue(delay)
        }
        e => {
            error!("Reconcile of {} failed, waiting for a spec change: {}", key, e);
            Action::await_change()
        }
    }
}
