use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use ipfs_operator::controller::{
    self, ConfigMapFollowSessions, Context, ControllerState, KubeStore, KubeWorkloadRuntime,
    ReconcileConfig, WorkloadImages,
};
use ipfs_operator::crd::{CircuitRelay, Ipfs};
use ipfs_operator::telemetry::{self, LogFormat};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the Ipfs nodes and relays in a namespace
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace holding the leader election lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Reconcile worker pool size per controller
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 8)]
    concurrency: u16,

    /// Kubo image for node pods
    #[arg(long, env = "IPFS_IMAGE")]
    ipfs_image: Option<String>,

    /// ipfs-cluster image for node pods
    #[arg(long, env = "CLUSTER_IMAGE")]
    cluster_image: Option<String>,

    /// Image for the follower sidecar
    #[arg(long, env = "FOLLOWER_IMAGE")]
    follower_image: Option<String>,

    /// Relay daemon image
    #[arg(long, env = "RELAY_IMAGE")]
    relay_image: Option<String>,

    /// Consecutive transient failures before a node is marked Degraded
    #[arg(long, env = "MAX_TRANSIENT_ATTEMPTS", default_value_t = 5)]
    max_transient_attempts: u32,

    /// Act as leader without acquiring the lease (single replica only)
    #[arg(long, env = "DISABLE_LEADER_ELECTION")]
    disable_leader_election: bool,

    /// Port for /healthz, /readyz and /metrics
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl RunArgs {
    fn images(&self) -> WorkloadImages {
        let defaults = WorkloadImages::default();
        WorkloadImages {
            ipfs: self.ipfs_image.clone().unwrap_or(defaults.ipfs),
            cluster: self.cluster_image.clone().unwrap_or(defaults.cluster),
            follower: self.follower_image.clone().unwrap_or(defaults.follower),
            relay: self.relay_image.clone().unwrap_or(defaults.relay),
        }
    }

    fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            max_transient_attempts: self.max_transient_attempts.max(1),
            ..ReconcileConfig::default()
        }
    }
}

#[derive(Parser, Debug)]
struct InfoArgs {
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("ipfs-operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let nodes: Api<Ipfs> = Api::namespaced(client.clone(), &args.namespace);
    let relays: Api<CircuitRelay> = Api::namespaced(client, &args.namespace);

    let nodes = nodes.list(&ListParams::default()).await.context("failed to list Ipfs nodes")?;
    let relays = relays
        .list(&ListParams::default())
        .await
        .context("failed to list CircuitRelays")?;

    println!("Ipfs nodes: {}", nodes.items.len());
    for node in &nodes.items {
        let bound = node
            .status
            .as_ref()
            .map(|s| s.bound_relays().join(","))
            .unwrap_or_default();
        println!("  {} relays=[{}]", kube::ResourceExt::name_any(node), bound);
    }
    println!("CircuitRelays: {}", relays.items.len());
    Ok(())
}

async fn run_operator(args: RunArgs) -> anyhow::Result<()> {
    telemetry::init_telemetry(args.log_format)?;

    info!("Starting ipfs-operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let is_leader = Arc::new(AtomicBool::new(args.disable_leader_election));
    if args.disable_leader_election {
        warn!("Leader election disabled, acting as leader");
    } else {
        let lease_namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
        let identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        info!("Leader election using holder ID: {}", identity);

        let leases: Api<Lease> = Api::namespaced(client.clone(), &lease_namespace);
        let flag = Arc::clone(&is_leader);
        tokio::spawn(async move {
            run_leader_election(leases, lease_namespace, identity, flag).await;
        });
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested, abandoning in-flight reconciles");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    let context = Context::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(KubeWorkloadRuntime::new(client.clone(), args.images())),
        Arc::new(ConfigMapFollowSessions::new(client.clone())),
        args.reconcile_config(),
    )
    .with_leader_flag(Arc::clone(&is_leader))
    .with_shutdown_flag(shutdown);

    let state = Arc::new(ControllerState {
        client,
        context: Arc::new(context),
    });

    #[cfg(feature = "rest-api")]
    let probes = {
        let probes = ipfs_operator::rest_api::ProbeState::new(Arc::clone(&is_leader));
        let server_state = probes.clone();
        let port = args.http_port;
        tokio::spawn(async move {
            if let Err(e) = ipfs_operator::rest_api::run_server(server_state, port).await {
                error!("HTTP server error: {:?}", e);
            }
        });
        probes
    };

    let nodes = controller::run_node_controller(
        Arc::clone(&state),
        args.watch_namespace.clone(),
        args.concurrency,
    );
    let relays = controller::run_relay_controller(
        Arc::clone(&state),
        args.watch_namespace.clone(),
        args.concurrency,
    );

    #[cfg(feature = "rest-api")]
    probes.mark_started();

    let (node_result, relay_result) = tokio::join!(nodes, relays);

    telemetry::shutdown_telemetry();

    node_result.context("Ipfs controller failed")?;
    relay_result.context("CircuitRelay controller failed")?;
    Ok(())
}

const LEASE_NAME: &str = "ipfs-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

async fn run_leader_election(
    leases: Api<Lease>,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
) {
    loop {
        match try_acquire_or_renew(&leases, &namespace, &identity).await {
            Ok(true) => {
                if !is_leader.swap(true, Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.swap(false, Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let existing = match leases.get_opt(LEASE_NAME).await? {
        Some(existing) => existing,
        None => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            return Ok(true);
        }
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

    if current_holder == Some(identity) {
        let patch = serde_json::json!({
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        });
        leases
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(true);
    }

    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration as i64)
        })
        .unwrap_or(true);

    if !expired {
        return Ok(false);
    }

    info!("Lease held by {:?} has expired, taking over", current_holder);
    // The resourceVersion makes the takeover fail with 409 if another
    // replica got there first.
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": existing.metadata.resource_version },
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    });
    match leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}
