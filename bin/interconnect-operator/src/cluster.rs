//! Cluster API adapter
//!
//! `ClusterClient` is the only way the reconciler reaches the cluster. The
//! production implementation wraps a `kube::Client`; tests use an in-memory
//! fake. Writes are merge patches, and callers put the observed
//! `resourceVersion` in them so stale writes fail with a conflict.

use async_trait::async_trait;
use interconnect_api::{Interconnect, InterconnectStatus};
use interconnect_core::{Workload, WorkloadKind};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cluster API call {op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("Kubernetes error: {0}")]
    Api(#[from] kube::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster operations needed to reconcile an Interconnect
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_interconnect(&self, namespace: &str, name: &str) -> Result<Option<Interconnect>>;

    async fn patch_interconnect(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    /// Merge `status` into the status subresource. With `resource_version`
    /// set, the write fails with a conflict if the object changed since then.
    async fn patch_interconnect_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &InterconnectStatus,
    ) -> Result<()>;

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>>;

    async fn create_workload(&self, namespace: &str, workload: &Workload) -> Result<()>;

    async fn patch_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()>;

    /// Delete with background propagation; deleting a missing object succeeds
    async fn delete_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()>;

    async fn patch_service(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    async fn list_pod_names(&self, namespace: &str, selector: &str) -> Result<Vec<String>>;
}

/// `ClusterClient` backed by the Kubernetes API server
pub struct KubeClusterClient {
    client: Client,
    timeout: Duration,
}

impl KubeClusterClient {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        with_deadline(op, self.timeout, fut).await
    }
}

/// Run one API call under the per-call deadline
async fn with_deadline<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, kube::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(classify),
        Err(_) => Err(ClusterError::Timeout { op, timeout }),
    }
}

fn classify(err: kube::Error) -> ClusterError {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict(resp.message.clone()),
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(resp.message.clone()),
        _ => ClusterError::Api(err),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_interconnect(&self, namespace: &str, name: &str) -> Result<Option<Interconnect>> {
        let api: Api<Interconnect> = self.api(namespace);
        self.call("get interconnect", api.get_opt(name)).await
    }

    async fn patch_interconnect(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let api: Api<Interconnect> = self.api(namespace);
        self.call(
            "patch interconnect",
            api.patch(name, &PatchParams::default(), &Patch::Merge(patch)),
        )
        .await
        .map(|_| ())
    }

    async fn patch_interconnect_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &InterconnectStatus,
    ) -> Result<()> {
        let api: Api<Interconnect> = self.api(namespace);
        let mut patch = json!({ "status": status });
        if let Some(rv) = resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        self.call(
            "patch interconnect status",
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .map(|_| ())
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>> {
        match kind {
            WorkloadKind::ScaledGroup => {
                let api: Api<Deployment> = self.api(namespace);
                let found = self.call("get deployment", api.get_opt(name)).await?;
                Ok(found.map(Workload::ScaledGroup))
            }
            WorkloadKind::PerNodeGroup => {
                let api: Api<DaemonSet> = self.api(namespace);
                let found = self.call("get daemonset", api.get_opt(name)).await?;
                Ok(found.map(Workload::PerNodeGroup))
            }
        }
    }

    async fn create_workload(&self, namespace: &str, workload: &Workload) -> Result<()> {
        let pp = PostParams::default();
        match workload {
            Workload::ScaledGroup(deployment) => {
                let api: Api<Deployment> = self.api(namespace);
                self.call("create deployment", api.create(&pp, deployment))
                    .await
                    .map(|_| ())
            }
            Workload::PerNodeGroup(daemon_set) => {
                let api: Api<DaemonSet> = self.api(namespace);
                self.call("create daemonset", api.create(&pp, daemon_set))
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn patch_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let pp = PatchParams::default();
        match kind {
            WorkloadKind::ScaledGroup => {
                let api: Api<Deployment> = self.api(namespace);
                self.call("patch deployment", api.patch(name, &pp, &Patch::Merge(patch)))
                    .await
                    .map(|_| ())
            }
            WorkloadKind::PerNodeGroup => {
                let api: Api<DaemonSet> = self.api(namespace);
                self.call("patch daemonset", api.patch(name, &pp, &Patch::Merge(patch)))
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn delete_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Result<()> {
        let dp = DeleteParams::background();
        let result = match kind {
            WorkloadKind::ScaledGroup => {
                let api: Api<Deployment> = self.api(namespace);
                self.call("delete deployment", api.delete(name, &dp))
                    .await
                    .map(|_| ())
            }
            WorkloadKind::PerNodeGroup => {
                let api: Api<DaemonSet> = self.api(namespace);
                self.call("delete daemonset", api.delete(name, &dp))
                    .await
                    .map(|_| ())
            }
        };

        match result {
            Err(ClusterError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = self.api(namespace);
        self.call("get service", api.get_opt(name)).await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let api: Api<Service> = self.api(namespace);
        self.call("create service", api.create(&PostParams::default(), service))
            .await
            .map(|_| ())
    }

    async fn patch_service(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let api: Api<Service> = self.api(namespace);
        self.call(
            "patch service",
            api.patch(name, &PatchParams::default(), &Patch::Merge(patch)),
        )
        .await
        .map(|_| ())
    }

    async fn list_pod_names(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        let api: Api<Pod> = self.api(namespace);
        let pods = self
            .call("list pods", api.list(&ListParams::default().labels(selector)))
            .await?;
        Ok(pods.items.iter().map(|p| p.name_any()).collect())
    }
}
