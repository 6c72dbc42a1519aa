//! Interconnect controller: the reconcile loop converging each Interconnect
//! onto exactly one router workload plus its service.

use crate::backoff::Backoff;
use crate::cluster::{ClusterClient, ClusterError, KubeClusterClient};
use crate::config::OperatorConfig;
use crate::error::ReconcileError;
use crate::metrics::Metrics;
use crate::status::{next_status, Readiness};
use crate::workload::{Applied, Removal, WorkloadManager};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use interconnect_api::{Interconnect, InterconnectStatus};
use interconnect_core::plan::defaults_patch;
use interconnect_core::{DesiredState, WorkloadDescriptor};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::{self, Action};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{watcher, Controller};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Shared state handed to every reconciliation pass
pub struct Context {
    pub cluster: Arc<dyn ClusterClient>,
    pub config: OperatorConfig,
    pub backoff: Backoff,
    pub metrics: Metrics,
}

impl Context {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: OperatorConfig, metrics: Metrics) -> Self {
        let backoff = Backoff::new(config.backoff_base(), config.backoff_max());
        Self {
            cluster,
            config,
            backoff,
            metrics,
        }
    }
}

pub struct InterconnectController {
    client: Client,
    context: Arc<Context>,
}

impl InterconnectController {
    pub fn new(client: Client, config: OperatorConfig, metrics: Metrics) -> Self {
        let cluster = Arc::new(KubeClusterClient::new(client.clone(), config.api_timeout()));
        let context = Arc::new(Context::new(cluster, config, metrics));
        Self { client, context }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.context.config.watch_namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    /// Run until a shutdown signal is received
    pub async fn run(self) -> anyhow::Result<()> {
        let config = &self.context.config;
        info!(
            namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
            concurrency = config.concurrency,
            "Starting Interconnect reconciliation"
        );

        let interconnects: Api<Interconnect> = self.api();
        let deployments: Api<Deployment> = self.api();
        let daemon_sets: Api<DaemonSet> = self.api();
        let services: Api<Service> = self.api();

        // Owned-object events re-trigger the owning Interconnect
        let mut stream = Controller::new(interconnects, watcher::Config::default())
            .owns(deployments, watcher::Config::default())
            .owns(daemon_sets, watcher::Config::default())
            .owns(services, watcher::Config::default())
            .with_config(controller::Config::default().concurrency(config.concurrency))
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.context.clone())
            .boxed();

        while let Some(item) = stream.next().await {
            observe_outcome(&self.context, item);
        }

        info!("Interconnect controller stopped");
        Ok(())
    }
}

type Outcome = Result<(ObjectRef<Interconnect>, Action), controller::Error<ReconcileError, watcher::Error>>;

fn observe_outcome(ctx: &Context, outcome: Outcome) {
    match outcome {
        Ok((obj, _)) => debug!("Reconciled Interconnect {}", obj),
        // A queued retry fired after the Interconnect was deleted
        Err(controller::Error::ObjectNotFound(obj)) => {
            let key = format!("{}/{}", obj.namespace.as_deref().unwrap_or_default(), obj.name);
            ctx.backoff.reset(&key);
            debug!(%key, "Interconnect is gone, dropped its retry state");
        }
        Err(e) => warn!("Error in reconciliation stream: {}", e),
    }
}

fn object_key(interconnect: &Interconnect) -> String {
    format!(
        "{}/{}",
        interconnect.namespace().unwrap_or_default(),
        interconnect.name_any()
    )
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Reconcile one Interconnect under the whole-pass deadline
#[instrument(
    skip_all,
    fields(
        namespace = %interconnect.namespace().unwrap_or_default(),
        name = %interconnect.name_any()
    )
)]
pub async fn reconcile(
    interconnect: Arc<Interconnect>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let deadline = ctx.config.reconcile_timeout();

    let result = match tokio::time::timeout(deadline, reconcile_pass(&interconnect, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::Timeout(deadline)),
    };

    ctx.metrics.record_reconcile(result.is_ok(), started.elapsed());
    if result.is_ok() {
        ctx.backoff.reset(&object_key(&interconnect));
    }
    result
}

/// Requeue policy for failed passes.
///
/// Transient failures back off exponentially per Interconnect. Past the retry
/// ceiling every failure is logged as an error and the pass keeps being
/// retried at the capped interval. Anything else waits for the object to
/// change.
pub fn error_policy(
    interconnect: Arc<Interconnect>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    let key = object_key(&interconnect);

    if !error.is_retryable() {
        warn!(%key, "Reconciliation failed: {}", error);
        return Action::await_change();
    }

    let (delay, attempt) = ctx.backoff.next_delay(&key);
    if attempt > ctx.config.retry_ceiling {
        error!(
            %key,
            attempt,
            "Retries exhausted, requeueing at the capped interval: {}", error
        );
        return Action::requeue(ctx.config.backoff_max());
    }

    warn!(%key, attempt, ?delay, "Reconciliation failed, retrying: {}", error);
    Action::requeue(delay)
}

async fn reconcile_pass(
    interconnect: &Interconnect,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let cluster = ctx.cluster.as_ref();
    let namespace = interconnect
        .namespace()
        .ok_or(ReconcileError::MissingObjectKey(".metadata.namespace"))?;
    let name = interconnect.name_any();

    let Some(current) = cluster.get_interconnect(&namespace, &name).await? else {
        debug!("Interconnect no longer exists");
        return Ok(Action::await_change());
    };
    if current.metadata.deletion_timestamp.is_some() {
        debug!("Interconnect is being deleted, owned objects are left to garbage collection");
        return Ok(Action::await_change());
    }

    match converge(ctx, &current, &namespace, &name).await {
        Ok(action) => Ok(action),
        Err(e) => stop_if_vanished(cluster, &namespace, &name, e).await,
    }
}

/// A write that failed with NotFound may mean the Interconnect was deleted
/// mid-pass, which ends the pass successfully
async fn stop_if_vanished(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    err: ReconcileError,
) -> Result<Action, ReconcileError> {
    if matches!(err, ReconcileError::Cluster(ClusterError::NotFound(_)))
        && reread(cluster, namespace, name).await?.is_none()
    {
        return Ok(Action::await_change());
    }
    Err(err)
}

/// Fetch the Interconnect again; `None` means it was deleted mid-pass
async fn reread(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
) -> Result<Option<Interconnect>, ReconcileError> {
    let latest = cluster.get_interconnect(namespace, name).await?;
    if latest.is_none() {
        info!("Interconnect deleted mid-pass, stopping");
    }
    Ok(latest)
}

/// Write `status` over the status of `observed`, guarded by its
/// `resourceVersion` so a concurrent status writer is never overwritten
async fn write_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    observed: &Interconnect,
    status: &InterconnectStatus,
) -> Result<(), ReconcileError> {
    if observed.status.clone().unwrap_or_default() == *status {
        return Ok(());
    }
    ctx.cluster
        .patch_interconnect_status(
            namespace,
            name,
            observed.metadata.resource_version.as_deref(),
            status,
        )
        .await?;
    ctx.metrics.record_write("Interconnect", "patch-status");
    Ok(())
}

fn converged_message(desired: &DesiredState) -> String {
    match desired.descriptor {
        WorkloadDescriptor::ScaledGroup { replicas } => {
            format!("Deployment {} has {} replicas", desired.name, replicas)
        }
        WorkloadDescriptor::PerNodeGroup => {
            format!("DaemonSet {} runs on every eligible node", desired.name)
        }
    }
}

async fn converge(
    ctx: &Context,
    current: &Interconnect,
    namespace: &str,
    name: &str,
) -> Result<Action, ReconcileError> {
    let cluster = ctx.cluster.as_ref();
    let generation = current.metadata.generation;

    let desired = match DesiredState::build(current) {
        Ok(desired) => desired,
        Err(e) => {
            warn!("Invalid deployment plan: {}", e);
            let previous = current.status.clone().unwrap_or_default();
            let status = next_status(
                &previous,
                &Readiness::ValidationFailed {
                    message: e.to_string(),
                },
                previous.pod_names.clone(),
                previous.workload_kind.as_deref(),
                generation,
                &now(),
            );
            write_status(ctx, namespace, name, current, &status).await?;
            return Ok(Action::await_change());
        }
    };

    let owner = current
        .controller_owner_ref(&())
        .ok_or(ReconcileError::MissingObjectKey(".metadata.uid"))?;

    if let Some(mut patch) = defaults_patch(&current.spec.deployment_plan) {
        patch["metadata"] = json!({ "resourceVersion": current.metadata.resource_version });
        cluster.patch_interconnect(namespace, name, &patch).await?;
        ctx.metrics.record_write("Interconnect", "patch");
        info!("Wrote defaulted deployment plan back");
    }

    let manager = WorkloadManager::new(cluster, &ctx.metrics, owner, namespace, name);
    let kind = desired.kind();
    let stale = kind.other();
    let mut waiting = None;
    let mut conflicts = Vec::new();

    // The stale kind must be gone before the desired kind is created, so
    // both never exist at once.
    match manager.remove(stale).await? {
        Removal::Terminating => {
            info!(
                from = stale.api_kind(),
                to = kind.api_kind(),
                "Waiting for stale workload to terminate"
            );
            waiting = Some(format!("Waiting for {} {} to be deleted", stale.api_kind(), name));
        }
        Removal::Absent | Removal::Removed => match manager.ensure(&desired.workload()).await {
            Ok(Applied::Terminating) => {
                waiting = Some(format!("Waiting for {} {} to be deleted", kind.api_kind(), name));
            }
            Ok(applied) => debug!(?applied, kind = kind.api_kind(), "Workload ensured"),
            Err(e @ ReconcileError::OwnershipConflict { .. }) => {
                warn!("{}", e);
                conflicts.push(e.to_string());
            }
            Err(e) => return Err(e),
        },
    }

    if reread(cluster, namespace, name).await?.is_none() {
        return Ok(Action::await_change());
    }

    match manager.ensure_service(&desired.service).await {
        Ok(Applied::Terminating) => {
            if waiting.is_none() {
                waiting = Some(format!("Waiting for Service {} to be deleted", name));
            }
        }
        Ok(applied) => debug!(?applied, "Service ensured"),
        Err(e @ ReconcileError::OwnershipConflict { .. }) => {
            warn!("{}", e);
            conflicts.push(e.to_string());
        }
        Err(e) => return Err(e),
    }

    let pod_names = cluster
        .list_pod_names(namespace, &desired.pod_selector())
        .await?;

    let (readiness, workload_kind, action) = if !conflicts.is_empty() {
        (
            Readiness::OwnershipConflict {
                message: conflicts.join("; "),
            },
            None,
            Action::requeue(ctx.config.resync_interval()),
        )
    } else if let Some(message) = waiting {
        (
            Readiness::Transitioning { message },
            None,
            Action::requeue(ctx.config.transition_poll()),
        )
    } else {
        (
            Readiness::Converged {
                message: converged_message(&desired),
            },
            Some(kind.api_kind()),
            Action::requeue(ctx.config.resync_interval()),
        )
    };

    // Status is computed over the latest copy; the write fails with a
    // conflict if anyone touches the object after this read.
    let Some(latest) = reread(cluster, namespace, name).await? else {
        return Ok(Action::await_change());
    };
    let previous = latest.status.clone().unwrap_or_default();

    let status = next_status(
        &previous,
        &readiness,
        pod_names,
        workload_kind,
        generation,
        &now(),
    );
    write_status(ctx, namespace, name, &latest, &status).await?;

    Ok(action)
}
