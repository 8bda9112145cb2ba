//! Reconciler for `Ipfs` nodes
//!
//! A pass validates the spec, binds circuit relays, converges the workload
//! with the bound relay addresses, syncs follow sessions and then derives the
//! node's conditions. Relays are resolved before the workload is applied
//! because the rendered node configuration embeds their addresses.

use std::sync::Arc;
#[cfg(feature = "metrics")]
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, ListParams};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{CircuitRelay, Ipfs, IpfsStatus, RelayRequirement};
use crate::error::{Error, ErrorClass, Result};

use super::backoff::RetryTracker;
use super::conditions::*;
use super::context::{requeue_for_error, scoped_api, Context, ControllerState};
use super::finalizers::IPFS_FINALIZER;
use super::follow_sync::{plan_follows, FollowOutcome};
#[cfg(feature = "metrics")]
use super::metrics;
use super::relay_resolver::{
    build_provisioned_relay, relays_to_provision, resolve_relays, RelayResolution,
};
use super::runtime::WorkloadHealth;

const CONTROLLER_NAME: &str = "ipfs";

fn workload_key(namespace: &str, name: &str) -> String {
    RetryTracker::key("ipfs", namespace, name)
}

fn relay_wait_key(namespace: &str, name: &str) -> String {
    RetryTracker::key("ipfs-relays", namespace, name)
}

/// Main entry point to start the node controller
pub async fn run_node_controller(
    state: Arc<ControllerState>,
    watch_namespace: Option<String>,
    concurrency: u16,
) -> Result<()> {
    let client = state.client.clone();
    let ns = watch_namespace.as_deref();
    let nodes: Api<Ipfs> = scoped_api(&client, ns);

    info!("Starting Ipfs controller");

    if let Err(e) = nodes.list(&ListParams::default().limit(1)).await {
        error!("Ipfs CRD not found. Please install the CRDs first: {:?}", e);
        return Err(Error::ConfigError("Ipfs CRD not installed".to_string()));
    }

    let controller = Controller::new(nodes, Config::default())
        .with_config(controller::Config::default().concurrency(concurrency));
    let cache = controller.store();

    controller
        .owns::<StatefulSet>(scoped_api(&client, ns), Config::default())
        .owns::<Service>(scoped_api(&client, ns), Config::default())
        .owns::<ConfigMap>(scoped_api(&client, ns), Config::default())
        .watches(
            scoped_api::<CircuitRelay>(&client, ns),
            Config::default(),
            move |relay| nodes_for_relay(&cache.state(), &relay),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    info!("Ipfs controller stopped");
    Ok(())
}

/// Nodes that must re-resolve when `relay` changes
///
/// Covers nodes that bound it, nodes naming it, and every pool-mode node in
/// the same namespace.
pub fn nodes_for_relay(nodes: &[Arc<Ipfs>], relay: &CircuitRelay) -> Vec<ObjectRef<Ipfs>> {
    let relay_name = relay.name_any();
    let namespace = relay.namespace();

    nodes
        .iter()
        .filter(|node| node.namespace() == namespace)
        .filter(|node| {
            let bound = node
                .status
                .as_ref()
                .is_some_and(|s| s.bound_relays().contains(&relay_name));
            let wanted = match &node.spec.relays {
                Some(RelayRequirement::Named(names)) => names.contains(&relay_name),
                Some(RelayRequirement::Pool(_)) => true,
                None => false,
            };
            bound || wanted
        })
        .map(|node| ObjectRef::from_obj(node.as_ref()))
        .collect()
}

async fn reconcile(obj: Arc<Ipfs>, state: Arc<ControllerState>) -> Result<Action> {
    let ctx = &state.context;
    if !ctx.is_leader() {
        debug!("Not the leader, skipping Ipfs {}", obj.name_any());
        return Ok(Action::requeue(ctx.config.progressing_requeue));
    }

    #[cfg(feature = "metrics")]
    let started = Instant::now();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Ipfs> = Api::namespaced(state.client.clone(), &namespace);

    let result = finalizer(&api, IPFS_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(node) => apply_node(ctx, &node).await,
            FinalizerEvent::Cleanup(node) => cleanup_node(ctx, &node).await,
        }
    })
    .await
    .map_err(Error::from);

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(CONTROLLER_NAME, started.elapsed().as_secs_f64());

    result
}

fn error_policy(node: Arc<Ipfs>, error: &Error, state: Arc<ControllerState>) -> Action {
    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(CONTROLLER_NAME, error.kind());

    let namespace = node.namespace().unwrap_or_else(|| "default".to_string());
    requeue_for_error(
        &state.context,
        &workload_key(&namespace, &node.name_any()),
        error,
    )
}

/// Outcome of readiness aggregation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub reason: &'static str,
    pub message: String,
}

/// Derive `Ready` from the three readiness inputs
///
/// Ready only if the workload is healthy, the relay requirement (if any) is
/// satisfied by live relays, and follow sync is not blocked. Otherwise the
/// first failing input, in that order, supplies the reason.
pub fn aggregate_readiness(
    health: &WorkloadHealth,
    relays: &RelayResolution,
    follows: &FollowOutcome,
) -> Readiness {
    let not_ready = |reason, message: String| Readiness {
        ready: false,
        reason,
        message,
    };

    match health {
        WorkloadHealth::Failing { message } => {
            return not_ready(REASON_WORKLOAD_FAILING, message.clone())
        }
        WorkloadHealth::Provisioning { message } => {
            return not_ready(REASON_WORKLOAD_PROVISIONING, message.clone())
        }
        WorkloadHealth::Healthy => {}
    }
    if relays.required && !relays.is_complete() {
        return not_ready(REASON_RELAYS_PENDING, relays.summary());
    }
    if relays.required && !relays.stale.is_empty() {
        return not_ready(REASON_RELAY_UNAVAILABLE, relays.summary());
    }
    if follows.is_blocking() {
        return not_ready(REASON_FOLLOWS_FAILED, follows.summary());
    }

    Readiness {
        ready: true,
        reason: REASON_NODE_READY,
        message: "Node is ready".to_string(),
    }
}

/// Apply/converge an `Ipfs` node
#[instrument(skip(ctx, node), fields(name = %node.name_any(), namespace = node.namespace()))]
pub async fn apply_node(ctx: &Context, node: &Ipfs) -> Result<Action> {
    ctx.checkpoint()?;
    let namespace = node.namespace().unwrap_or_else(|| "default".to_string());
    let name = node.name_any();
    let now = Utc::now();
    let mut status = node.status.clone().unwrap_or_default();

    info!("Reconciling Ipfs {}/{}", namespace, name);

    if let Err(errors) = node.spec.validate(&name) {
        let err = Error::ValidationError(errors);
        warn!("Validation failed for {}/{}: {}", namespace, name, err);
        set_condition_bool(
            status.conditions_mut(),
            CONDITION_TYPE_READY,
            false,
            REASON_INVALID_SPEC,
            &err.to_string(),
            now,
        );
        finish_status(&mut status, node.metadata.generation);
        persist_status(ctx, node, status).await?;
        return Ok(Action::await_change());
    }

    // Relays
    let resolution = resolve_node_relays(ctx, node, &namespace, &status).await?;
    record_relay_condition(&mut status, &resolution, now);
    status.circuit_relays = Some(resolution.bound.clone());
    #[cfg(feature = "metrics")]
    metrics::set_relay_bindings(&namespace, &name, resolution.bound.len());

    // Workload
    let key = workload_key(&namespace, &name);
    ctx.checkpoint()?;
    let health = match ctx
        .runtime
        .ensure_node_workload(node, &resolution.addr_infos)
        .await
    {
        Ok(health) => {
            ctx.retries.reset(&key);
            health
        }
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => return workload_failed(ctx, node, status, &key, e, now).await,
    };
    record_workload_condition(&mut status, &health, now);

    // Follows
    let follows = sync_follows(ctx, node).await?;
    record_follow_condition(&mut status, &follows, now);

    let readiness = aggregate_readiness(&health, &resolution, &follows);
    set_condition_bool(
        status.conditions_mut(),
        CONDITION_TYPE_READY,
        readiness.ready,
        readiness.reason,
        &readiness.message,
        now,
    );
    match &health {
        WorkloadHealth::Failing { message } => set_condition_bool(
            status.conditions_mut(),
            CONDITION_TYPE_DEGRADED,
            true,
            REASON_WORKLOAD_FAILING,
            message,
            now,
        ),
        _ => set_condition_bool(
            status.conditions_mut(),
            CONDITION_TYPE_DEGRADED,
            false,
            REASON_NO_ISSUES,
            "",
            now,
        ),
    }

    finish_status(&mut status, node.metadata.generation);
    persist_status(ctx, node, status).await?;

    if readiness.ready {
        info!("Ipfs {}/{} is ready", namespace, name);
    } else {
        info!(
            "Ipfs {}/{} not ready ({}): {}",
            namespace, name, readiness.reason, readiness.message
        );
    }

    Ok(next_action(ctx, &namespace, &name, &readiness, &resolution, &follows))
}

/// Release everything the node holds before its finalizer is removed
#[instrument(skip(ctx, node), fields(name = %node.name_any(), namespace = node.namespace()))]
pub async fn cleanup_node(ctx: &Context, node: &Ipfs) -> Result<Action> {
    let namespace = node.namespace().unwrap_or_else(|| "default".to_string());
    let name = node.name_any();

    info!("Cleaning up Ipfs {}/{}", namespace, name);

    ctx.checkpoint()?;
    ctx.follows.clear(node).await?;
    ctx.checkpoint()?;
    ctx.runtime.release_node_workload(node).await?;

    let bound = node
        .status
        .as_ref()
        .map(|s| s.bound_relays().to_vec())
        .unwrap_or_default();
    if !bound.is_empty() {
        info!("Released relay bindings for {}/{}: {:?}", namespace, name, bound);
    }

    ctx.retries.reset(&workload_key(&namespace, &name));
    ctx.retries.reset(&relay_wait_key(&namespace, &name));
    #[cfg(feature = "metrics")]
    metrics::clear_relay_bindings(&namespace, &name);

    Ok(Action::await_change())
}

async fn resolve_node_relays(
    ctx: &Context,
    node: &Ipfs,
    namespace: &str,
    status: &IpfsStatus,
) -> Result<RelayResolution> {
    let Some(requirement) = node.spec.relays.as_ref().filter(|r| r.is_required()) else {
        return Ok(RelayResolution::default());
    };

    // Bindings only carry over while the spec they were made for is unchanged
    let same_generation =
        status.observed_generation.is_some() && status.observed_generation == node.metadata.generation;
    let sticky: &[String] = if same_generation {
        status.bound_relays()
    } else {
        &[]
    };

    ctx.checkpoint()?;
    let relays = ctx.store.list_relays(namespace).await?;
    let resolution = resolve_relays(Some(requirement), &relays, sticky);

    if let RelayRequirement::Pool(pool) = requirement {
        if resolution.shortfall > 0 {
            for relay_name in relays_to_provision(&node.name_any(), pool, &relays) {
                ctx.checkpoint()?;
                info!("Provisioning CircuitRelay {}/{}", namespace, relay_name);
                ctx.store
                    .create_relay(&build_provisioned_relay(node, &relay_name, pool))
                    .await?;
            }
        }
    }

    Ok(resolution)
}

async fn sync_follows(ctx: &Context, node: &Ipfs) -> Result<FollowOutcome> {
    ctx.checkpoint()?;
    let established = match ctx.follows.established(node).await {
        Ok(sessions) => sessions,
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => {
            warn!("Could not list follow sessions of {}: {}", node.name_any(), e);
            let plan = plan_follows(node.spec.follows(), &[]);
            let failed = plan
                .add
                .iter()
                .map(|s| (s.name.clone(), e.to_string()))
                .collect();
            return Ok(FollowOutcome {
                required: plan.desired() + plan.invalid.len(),
                established: 0,
                failed,
                invalid: plan.invalid,
            });
        }
    };

    let plan = plan_follows(node.spec.follows(), &established);
    for invalid in &plan.invalid {
        warn!("Skipping invalid follow {}: {}", invalid.name, invalid.message);
    }

    for target in &plan.remove {
        ctx.checkpoint()?;
        match ctx.follows.remove(node, target).await {
            Ok(()) => {}
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!("Failed to stop follow session {}: {}", target, e),
        }
    }

    let mut outcome = FollowOutcome {
        required: plan.desired() + plan.invalid.len(),
        established: plan.retained,
        failed: Vec::new(),
        invalid: plan.invalid.clone(),
    };
    for session in &plan.update {
        ctx.checkpoint()?;
        info!("Restarting follow session {} -> {}", session.name, session.target);
        let restarted = match ctx.follows.remove(node, &session.target).await {
            Ok(()) => ctx.follows.create(node, session).await,
            Err(e) => Err(e),
        };
        match restarted {
            Ok(()) => outcome.established += 1,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!("Failed to restart follow session {}: {}", session.name, e);
                outcome.failed.push((session.name.clone(), e.to_string()));
            }
        }
    }
    for session in &plan.add {
        ctx.checkpoint()?;
        match ctx.follows.create(node, session).await {
            Ok(()) => outcome.established += 1,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!("Failed to start follow session {}: {}", session.name, e);
                outcome.failed.push((session.name.clone(), e.to_string()));
            }
        }
    }

    Ok(outcome)
}

/// Record a failed workload apply and decide the requeue
async fn workload_failed(
    ctx: &Context,
    node: &Ipfs,
    mut status: IpfsStatus,
    key: &str,
    err: Error,
    now: DateTime<Utc>,
) -> Result<Action> {
    let attempt = ctx.retries.bump(key);
    let message = err.to_string();
    warn!(
        "Workload for {} failed (attempt {}): {}",
        node.name_any(),
        attempt + 1,
        message
    );

    for type_ in [CONDITION_TYPE_WORKLOAD_READY, CONDITION_TYPE_READY] {
        set_condition_bool(
            status.conditions_mut(),
            type_,
            false,
            REASON_WORKLOAD_ERROR,
            &message,
            now,
        );
    }

    let action = match err.class() {
        ErrorClass::Transient => {
            if attempt + 1 >= ctx.config.max_transient_attempts {
                set_condition_bool(
                    status.conditions_mut(),
                    CONDITION_TYPE_DEGRADED,
                    true,
                    REASON_RETRIES_EXHAUSTED,
                    &format!("{} consecutive workload failures: {}", attempt + 1, message),
                    now,
                );
            }
            Action::requeue(ctx.config.transient_backoff(attempt))
        }
        ErrorClass::Configuration => {
            set_condition_bool(
                status.conditions_mut(),
                CONDITION_TYPE_DEGRADED,
                true,
                REASON_WORKLOAD_ERROR,
                &message,
                now,
            );
            Action::await_change()
        }
    };

    finish_status(&mut status, node.metadata.generation);
    persist_status(ctx, node, status).await?;
    Ok(action)
}

fn record_relay_condition(status: &mut IpfsStatus, resolution: &RelayResolution, now: DateTime<Utc>) {
    let (bound, reason) = if !resolution.required {
        (true, REASON_RELAYS_NOT_REQUIRED)
    } else if !resolution.is_complete() {
        (false, REASON_RELAYS_PENDING)
    } else if !resolution.stale.is_empty() {
        (false, REASON_RELAY_UNAVAILABLE)
    } else {
        (true, REASON_RELAYS_BOUND)
    };
    set_condition_bool(
        status.conditions_mut(),
        CONDITION_TYPE_RELAY_BOUND,
        bound,
        reason,
        &resolution.summary(),
        now,
    );
}

fn record_workload_condition(status: &mut IpfsStatus, health: &WorkloadHealth, now: DateTime<Utc>) {
    let reason = match health {
        WorkloadHealth::Healthy => REASON_WORKLOAD_HEALTHY,
        WorkloadHealth::Provisioning { .. } => REASON_WORKLOAD_PROVISIONING,
        WorkloadHealth::Failing { .. } => REASON_WORKLOAD_FAILING,
    };
    set_condition_bool(
        status.conditions_mut(),
        CONDITION_TYPE_WORKLOAD_READY,
        health.is_healthy(),
        reason,
        health.message(),
        now,
    );
}

fn record_follow_condition(status: &mut IpfsStatus, follows: &FollowOutcome, now: DateTime<Utc>) {
    let (synced, reason) = if follows.required == 0 {
        (true, REASON_NO_FOLLOWS)
    } else if follows.is_complete() {
        (true, REASON_FOLLOWS_SYNCED)
    } else if follows.is_blocking() {
        (false, REASON_FOLLOWS_FAILED)
    } else {
        (false, REASON_FOLLOWS_PARTIAL)
    };
    set_condition_bool(
        status.conditions_mut(),
        CONDITION_TYPE_FOLLOWS_SYNCED,
        synced,
        reason,
        &follows.summary(),
        now,
    );
}

fn finish_status(status: &mut IpfsStatus, generation: Option<i64>) {
    status.observed_generation = generation;
    set_observed_generation(status.conditions_mut(), generation);
}

/// Write status only when this pass changed it
async fn persist_status(ctx: &Context, node: &Ipfs, status: IpfsStatus) -> Result<()> {
    if node.status.as_ref() == Some(&status) {
        debug!("Status of {} unchanged", node.name_any());
        return Ok(());
    }
    ctx.checkpoint()?;
    ctx.store.update_node_status(node, &status).await
}

fn next_action(
    ctx: &Context,
    namespace: &str,
    name: &str,
    readiness: &Readiness,
    relays: &RelayResolution,
    follows: &FollowOutcome,
) -> Action {
    let relay_key = relay_wait_key(namespace, name);
    if relays.required && !relays.is_healthy() {
        let attempt = ctx.retries.bump(&relay_key);
        return Action::requeue(ctx.config.relay_backoff(attempt));
    }
    ctx.retries.reset(&relay_key);

    if readiness.ready {
        Action::requeue(ctx.config.ready_resync)
    } else if readiness.reason == REASON_FOLLOWS_FAILED && follows.blocked_by_config() {
        Action::await_change()
    } else {
        Action::requeue(ctx.config.progressing_requeue)
    }
}
