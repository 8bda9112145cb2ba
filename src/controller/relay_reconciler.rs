//! Reconciler for `CircuitRelay` resources
//!
//! Keeps the relay daemon running and publishes its `addrInfo`. A published
//! address is only ever replaced by a different one, never cleared: nodes may
//! have it cached in their configuration.

use std::sync::Arc;
#[cfg(feature = "metrics")]
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{CircuitRelay, CircuitRelayStatus};
use crate::error::{Error, ErrorClass, Result};

use super::backoff::RetryTracker;
use super::conditions::*;
use super::context::{requeue_for_error, scoped_api, Context, ControllerState};
use super::finalizers::CIRCUIT_RELAY_FINALIZER;
#[cfg(feature = "metrics")]
use super::metrics;

const CONTROLLER_NAME: &str = "circuitrelay";

fn relay_key(namespace: &str, name: &str) -> String {
    RetryTracker::key("circuitrelay", namespace, name)
}

fn address_wait_key(namespace: &str, name: &str) -> String {
    RetryTracker::key("circuitrelay-address", namespace, name)
}

/// Main entry point to start the relay controller
pub async fn run_relay_controller(
    state: Arc<ControllerState>,
    watch_namespace: Option<String>,
    concurrency: u16,
) -> Result<()> {
    let client = state.client.clone();
    let ns = watch_namespace.as_deref();
    let relays: Api<CircuitRelay> = scoped_api(&client, ns);

    info!("Starting CircuitRelay controller");

    if let Err(e) = relays.list(&ListParams::default().limit(1)).await {
        error!("CircuitRelay CRD not found. Please install the CRDs first: {:?}", e);
        return Err(Error::ConfigError("CircuitRelay CRD not installed".to_string()));
    }

    Controller::new(relays, Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .owns::<Deployment>(scoped_api(&client, ns), Config::default())
        .owns::<Service>(scoped_api(&client, ns), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    info!("CircuitRelay controller stopped");
    Ok(())
}

async fn reconcile(obj: Arc<CircuitRelay>, state: Arc<ControllerState>) -> Result<Action> {
    let ctx = &state.context;
    if !ctx.is_leader() {
        debug!("Not the leader, skipping CircuitRelay {}", obj.name_any());
        return Ok(Action::requeue(ctx.config.progressing_requeue));
    }

    #[cfg(feature = "metrics")]
    let started = Instant::now();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<CircuitRelay> = Api::namespaced(state.client.clone(), &namespace);

    let result = finalizer(&api, CIRCUIT_RELAY_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(relay) => apply_relay(ctx, &relay).await,
            FinalizerEvent::Cleanup(relay) => cleanup_relay(ctx, &relay).await,
        }
    })
    .await
    .map_err(Error::from);

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(CONTROLLER_NAME, started.elapsed().as_secs_f64());

    result
}

fn error_policy(relay: Arc<CircuitRelay>, error: &Error, state: Arc<ControllerState>) -> Action {
    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(CONTROLLER_NAME, error.kind());

    let namespace = relay.namespace().unwrap_or_else(|| "default".to_string());
    requeue_for_error(&state.context, &relay_key(&namespace, &relay.name_any()), error)
}

/// Apply/converge a `CircuitRelay`
#[instrument(skip(ctx, relay), fields(name = %relay.name_any(), namespace = relay.namespace()))]
pub async fn apply_relay(ctx: &Context, relay: &CircuitRelay) -> Result<Action> {
    ctx.checkpoint()?;
    let namespace = relay.namespace().unwrap_or_else(|| "default".to_string());
    let name = relay.name_any();
    let key = relay_key(&namespace, &name);
    let now = Utc::now();
    let mut status = relay.status.clone().unwrap_or_default();

    let workload = match ctx.runtime.ensure_relay_workload(relay).await {
        Ok(workload) => {
            ctx.retries.reset(&key);
            workload
        }
        Err(e) if e.class() == ErrorClass::Transient && !matches!(e, Error::Cancelled) => {
            let attempt = ctx.retries.bump(&key);
            warn!("Relay workload for {} failed (attempt {}): {}", name, attempt + 1, e);
            set_condition_bool(
                status.conditions_mut(),
                CONDITION_TYPE_READY,
                false,
                REASON_WORKLOAD_ERROR,
                &e.to_string(),
                now,
            );
            persist_status(ctx, relay, status).await?;
            return Ok(Action::requeue(ctx.config.transient_backoff(attempt)));
        }
        Err(e) => return Err(e),
    };

    if let Some(addr_info) = workload.addr_info.filter(|a| a.is_complete()) {
        if status.addr_info.as_ref() != Some(&addr_info) {
            info!(
                "Publishing addrInfo for CircuitRelay {}/{}: {} ({} addrs)",
                namespace,
                name,
                addr_info.id,
                addr_info.addrs.len()
            );
            status.addr_info = Some(addr_info);
        }
    }

    let published = status.addr_info.as_ref().map(|a| a.id.clone());
    match &published {
        Some(id) => set_condition_bool(
            status.conditions_mut(),
            CONDITION_TYPE_ADDRESS_RESOLVED,
            true,
            REASON_ADDRESS_PUBLISHED,
            &format!("peer {id}"),
            now,
        ),
        None => set_condition_bool(
            status.conditions_mut(),
            CONDITION_TYPE_ADDRESS_RESOLVED,
            false,
            REASON_AWAITING_ADDRESS,
            "waiting for the relay's external address",
            now,
        ),
    }

    let (ready, reason, message) = match (workload.healthy, published.is_some()) {
        (true, true) => (true, REASON_WORKLOAD_HEALTHY, "relay is serving"),
        (true, false) => (false, REASON_AWAITING_ADDRESS, "relay has no external address yet"),
        (false, _) => (false, REASON_WORKLOAD_PROVISIONING, "relay daemon is not ready"),
    };
    set_condition_bool(
        status.conditions_mut(),
        CONDITION_TYPE_READY,
        ready,
        reason,
        message,
        now,
    );

    persist_status(ctx, relay, status).await?;

    let wait_key = address_wait_key(&namespace, &name);
    if ready {
        ctx.retries.reset(&wait_key);
        Ok(Action::requeue(ctx.config.ready_resync))
    } else {
        let attempt = ctx.retries.bump(&wait_key);
        Ok(Action::requeue(ctx.config.relay_backoff(attempt)))
    }
}

/// Release the relay's workload
///
/// Nodes that bound this relay keep its name until their spec changes.
#[instrument(skip(ctx, relay), fields(name = %relay.name_any(), namespace = relay.namespace()))]
pub async fn cleanup_relay(ctx: &Context, relay: &CircuitRelay) -> Result<Action> {
    let namespace = relay.namespace().unwrap_or_else(|| "default".to_string());
    let name = relay.name_any();
    info!("Cleaning up CircuitRelay {}/{}", namespace, name);

    ctx.checkpoint()?;
    ctx.runtime.release_relay_workload(relay).await?;

    ctx.retries.reset(&relay_key(&namespace, &name));
    ctx.retries.reset(&address_wait_key(&namespace, &name));
    Ok(Action::await_change())
}

async fn persist_status(ctx: &Context, relay: &CircuitRelay, status: CircuitRelayStatus) -> Result<()> {
    if relay.status.as_ref() == Some(&status) {
        debug!("Status of {} unchanged", relay.name_any());
        return Ok(());
    }
    ctx.checkpoint()?;
    ctx.store.update_relay_status(relay, &status).await
}
