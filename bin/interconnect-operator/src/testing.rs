//! In-memory cluster for reconciler tests
//!
//! Objects are stored as JSON so merge patches apply the same way the API
//! server applies them. Every call is logged; writes carrying a stale
//! `resourceVersion` fail with a conflict.

use crate::cluster::{ClusterClient, ClusterError, Result};
use async_trait::async_trait;
use interconnect_api::{DeploymentPlan, Interconnect, InterconnectSpec, InterconnectStatus};
use interconnect_core::{Workload, WorkloadKind};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const INTERCONNECT: &str = "Interconnect";
const SERVICE: &str = "Service";

type Key = (&'static str, String, String);

/// Interconnect in namespace "test" with a fixed uid
pub fn sample_interconnect(name: &str, role: &str, placement: &str, size: i32) -> Interconnect {
    let mut ic = Interconnect::new(
        name,
        InterconnectSpec {
            deployment_plan: DeploymentPlan {
                role: Some(role.to_string()),
                placement: Some(placement.to_string()),
                size,
                ..Default::default()
            },
        },
    );
    ic.metadata.namespace = Some("test".to_string());
    ic.metadata.uid = Some(format!("{}-uid", name));
    ic
}

/// RFC 7386 JSON merge patch
pub fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Value::Object(map) = target {
        for (key, value) in fields {
            if value.is_null() {
                map.remove(key);
            } else {
                merge(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn key(kind: &'static str, namespace: &str, name: &str) -> Key {
    (kind, namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    calls: Vec<String>,
    patches: Vec<Value>,
    faults: Vec<(String, ClusterError)>,
    delays: Vec<(String, Duration)>,
    edits: Vec<(String, Value)>,
    vanish_on: Option<String>,
    defer_deletes: bool,
    nodes: usize,
    revision: u64,
}

impl State {
    /// Log a call, then fire any trigger or fault registered for it.
    /// Returns how long the call should stall before answering.
    fn begin(&mut self, call: String) -> Result<Duration> {
        if self
            .vanish_on
            .as_deref()
            .is_some_and(|prefix| call.starts_with(prefix))
        {
            self.vanish_on = None;
            self.objects.retain(|(kind, _, _), _| *kind != INTERCONNECT);
        }

        let edit = self
            .edits
            .iter()
            .position(|(prefix, _)| call.starts_with(prefix.as_str()));
        if let Some(i) = edit {
            let (_, patch) = self.edits.remove(i);
            let targets: Vec<Key> = self
                .objects
                .keys()
                .filter(|(kind, _, _)| *kind == INTERCONNECT)
                .cloned()
                .collect();
            for (_, namespace, name) in targets {
                self.patch(INTERCONNECT, &namespace, &name, &patch)?;
            }
        }

        let delay = self
            .delays
            .iter()
            .find(|(prefix, _)| call.starts_with(prefix.as_str()))
            .map(|(_, delay)| *delay)
            .unwrap_or_default();

        let fault = self
            .faults
            .iter()
            .position(|(prefix, _)| call.starts_with(prefix.as_str()));
        self.calls.push(call);
        match fault {
            Some(i) => Err(self.faults.remove(i).1),
            None => Ok(delay),
        }
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn get<K: DeserializeOwned>(&self, kind: &'static str, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .get(&key(kind, namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    fn create<K: Serialize>(&mut self, kind: &'static str, object: &K) -> Result<()> {
        let mut value = serde_json::to_value(object).unwrap();
        let namespace = value["metadata"]["namespace"].as_str().unwrap_or_default().to_string();
        let name = value["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let key = key(kind, &namespace, &name);
        if self.objects.contains_key(&key) {
            return Err(ClusterError::Conflict(format!(
                "{} {}/{} already exists",
                kind, namespace, name
            )));
        }

        let revision = self.next_revision();
        let meta = &mut value["metadata"];
        meta["resourceVersion"] = json!(revision);
        if meta.get("uid").is_none() {
            meta["uid"] = json!(format!("{}-{}", kind.to_lowercase(), revision));
        }
        if kind == INTERCONNECT {
            meta["generation"] = json!(1);
        }
        self.objects.insert(key, value);
        Ok(())
    }

    fn patch(&mut self, kind: &'static str, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let key = key(kind, namespace, name);
        let Some(current) = self.objects.get(&key) else {
            return Err(ClusterError::NotFound(format!("{} {}/{}", kind, namespace, name)));
        };

        let expected = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        let stored = current.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        if expected.is_some() && expected != stored {
            return Err(ClusterError::Conflict(format!(
                "{} {}/{} has been modified",
                kind, namespace, name
            )));
        }

        let revision = self.next_revision();
        let Some(current) = self.objects.get_mut(&key) else {
            return Err(ClusterError::NotFound(format!("{} {}/{}", kind, namespace, name)));
        };
        let spec_before = current.get("spec").cloned();
        merge(current, patch);
        current["metadata"]["resourceVersion"] = json!(revision);
        if kind == INTERCONNECT && current.get("spec").cloned() != spec_before {
            let generation = current["metadata"]["generation"].as_i64().unwrap_or(1);
            current["metadata"]["generation"] = json!(generation + 1);
        }
        self.patches.push(patch.clone());
        Ok(())
    }

    fn delete(&mut self, kind: &'static str, namespace: &str, name: &str) {
        let key = key(kind, namespace, name);
        if self.defer_deletes {
            let revision = self.next_revision();
            if let Some(object) = self.objects.get_mut(&key) {
                object["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
                object["metadata"]["resourceVersion"] = json!(revision);
            }
        } else {
            self.objects.remove(&key);
        }
    }

    fn pod_names(&self, namespace: &str, selector: &str) -> Vec<String> {
        let wanted: Vec<(&str, &str)> = selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();

        let mut names = Vec::new();
        for ((kind, ns, name), value) in &self.objects {
            if ns != namespace || (*kind != "Deployment" && *kind != "DaemonSet") {
                continue;
            }
            let labels = &value["spec"]["template"]["metadata"]["labels"];
            if !wanted.iter().all(|(k, v)| labels[*k].as_str() == Some(*v)) {
                continue;
            }
            if *kind == "Deployment" {
                let replicas = value["spec"]["replicas"].as_u64().unwrap_or(1);
                names.extend((0..replicas).map(|i| format!("{}-{}", name, i)));
            } else {
                names.extend((0..self.nodes).map(|i| format!("{}-node{}", name, i)));
            }
        }
        // Server order is not sorted
        names.reverse();
        names
    }
}

/// `ClusterClient` over an in-memory object store
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                nodes: 2,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Run the call hooks, then stall without holding the lock
    async fn enter(&self, call: String) -> Result<()> {
        let delay = self.lock().begin(call)?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Store an Interconnect as a user would create it
    pub fn apply_interconnect(&self, interconnect: &Interconnect) {
        self.lock().create(INTERCONNECT, interconnect).unwrap();
    }

    /// Merge `patch` into an Interconnect's deployment plan as a user edit
    pub fn update_plan(&self, namespace: &str, name: &str, patch: Value) {
        self.lock()
            .patch(
                INTERCONNECT,
                namespace,
                name,
                &json!({ "spec": { "deploymentPlan": patch } }),
            )
            .unwrap();
    }

    /// Delete every Interconnect just before the first call starting with `prefix`
    pub fn vanish_on(&self, prefix: &str) {
        self.lock().vanish_on = Some(prefix.to_string());
    }

    /// Stall every call starting with `prefix` for `delay`
    pub fn delay_on(&self, prefix: &str, delay: Duration) {
        self.lock().delays.push((prefix.to_string(), delay));
    }

    /// Merge `patch` into every Interconnect just before the next call
    /// starting with `prefix`, as a concurrent writer would
    pub fn edit_interconnects_on(&self, prefix: &str, patch: Value) {
        self.lock().edits.push((prefix.to_string(), patch));
    }

    /// Set a deletion timestamp on an Interconnect held by a finalizer
    pub fn mark_deleting(&self, namespace: &str, name: &str) {
        self.lock()
            .patch(
                INTERCONNECT,
                namespace,
                name,
                &json!({ "metadata": { "deletionTimestamp": "2024-01-01T00:00:00Z" } }),
            )
            .unwrap();
    }

    /// Fail the next call starting with `prefix` with `error`
    pub fn fail_next(&self, prefix: &str, error: ClusterError) {
        self.lock().faults.push((prefix.to_string(), error));
    }

    /// Keep deleted objects around with a deletion timestamp until
    /// `finish_deletes` is called
    pub fn defer_deletes(&self, defer: bool) {
        self.lock().defer_deletes = defer;
    }

    pub fn finish_deletes(&self) {
        self.lock()
            .objects
            .retain(|_, v| v["metadata"].get("deletionTimestamp").is_none());
    }

    pub fn insert_foreign_service(&self, namespace: &str, name: &str) {
        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "ConfigMap".to_string(),
                    name: "someone-else".to_string(),
                    uid: "someone-else-uid".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        self.lock().create(SERVICE, &service).unwrap();
    }

    pub fn interconnect(&self, namespace: &str, name: &str) -> Option<Interconnect> {
        self.lock().get(INTERCONNECT, namespace, name)
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.lock().get("Deployment", namespace, name)
    }

    pub fn daemon_set(&self, namespace: &str, name: &str) -> Option<DaemonSet> {
        self.lock().get("DaemonSet", namespace, name)
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.lock().get(SERVICE, namespace, name)
    }

    pub fn workload(&self, namespace: &str, name: &str, kind: WorkloadKind) -> Option<Workload> {
        match kind {
            WorkloadKind::ScaledGroup => self.deployment(namespace, name).map(Workload::ScaledGroup),
            WorkloadKind::PerNodeGroup => self.daemon_set(namespace, name).map(Workload::PerNodeGroup),
        }
    }

    /// Workload kinds stored for `name`, terminating ones included
    pub fn workload_kinds(&self, namespace: &str, name: &str) -> Vec<WorkloadKind> {
        [WorkloadKind::ScaledGroup, WorkloadKind::PerNodeGroup]
            .into_iter()
            .filter(|kind| self.workload(namespace, name, *kind).is_some())
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Mutating calls, in order
    pub fn writes(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| {
                c.starts_with("create ") || c.starts_with("patch ") || c.starts_with("delete ")
            })
            .cloned()
            .collect()
    }

    pub fn last_patch(&self) -> Option<Value> {
        self.lock().patches.last().cloned()
    }

    pub fn clear_calls(&self) {
        let mut state = self.lock();
        state.calls.clear();
        state.patches.clear();
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_interconnect(&self, namespace: &str, name: &str) -> Result<Option<Interconnect>> {
        self.enter(format!("get Interconnect {}/{}", namespace, name)).await?;
        let state = self.lock();
        Ok(state.get(INTERCONNECT, namespace, name))
    }

    async fn patch_interconnect(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        self.enter(format!("patch Interconnect {}/{}", namespace, name)).await?;
        let mut state = self.lock();
        state.patch(INTERCONNECT, namespace, name, patch)
    }

    async fn patch_interconnect_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &InterconnectStatus,
    ) -> Result<()> {
        self.enter(format!("patch Interconnect/status {}/{}", namespace, name)).await?;
        let mut state = self.lock();
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        state.patch(INTERCONNECT, namespace, name, &patch)
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>> {
        self.enter(format!("get {} {}/{}", kind.api_kind(), namespace, name)).await?;
        let state = self.lock();
        Ok(match kind {
            WorkloadKind::ScaledGroup => state
                .get("Deployment", namespace, name)
                .map(Workload::ScaledGroup),
            WorkloadKind::PerNodeGroup => state
                .get("DaemonSet", namespace, name)
                .map(Workload::PerNodeGroup),
        })
    }

    async fn create_workload(&self, namespace: &str, workload: &Workload) -> Result<()> {
        let kind = workload.kind().api_kind();
        let name = workload.metadata().name.clone().unwrap_or_default();
        self.enter(format!("create {} {}/{}", kind, namespace, name)).await?;
        let mut state = self.lock();
        match workload {
            Workload::ScaledGroup(deployment) => state.create(kind, deployment),
            Workload::PerNodeGroup(daemon_set) => state.create(kind, daemon_set),
        }
    }

    async fn patch_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let kind = kind.api_kind();
        self.enter(format!("patch {} {}/{}", kind, namespace, name)).await?;
        let mut state = self.lock();
        state.patch(kind, namespace, name, patch)
    }

    async fn delete_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Result<()> {
        let kind = kind.api_kind();
        self.enter(format!("delete {} {}/{}", kind, namespace, name)).await?;
        let mut state = self.lock();
        state.delete(kind, namespace, name);
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.enter(format!("get Service {}/{}", namespace, name)).await?;
        let state = self.lock();
        Ok(state.get(SERVICE, namespace, name))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.enter(format!("create Service {}/{}", namespace, name)).await?;
        let mut state = self.lock();
        state.create(SERVICE, service)
    }

    async fn patch_service(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        self.enter(format!("patch Service {}/{}", namespace, name)).await?;
        let mut state = self.lock();
        state.patch(SERVICE, namespace, name, patch)
    }

    async fn list_pod_names(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        self.enter(format!("list Pod {}", namespace)).await?;
        let state = self.lock();
        Ok(state.pod_names(namespace, selector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});
        merge(&mut target, &json!({"b": {"c": null, "f": 4}, "e": [3]}));
        assert_eq!(target, json!({"a": 1, "b": {"d": 3, "f": 4}, "e": [3]}));
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let cluster = FakeCluster::new();
        cluster.apply_interconnect(&sample_interconnect("r1", "interior", "Any", 1));
        let rv = cluster
            .interconnect("test", "r1")
            .unwrap()
            .metadata
            .resource_version
            .unwrap();

        let patch = json!({"metadata": {"resourceVersion": rv}, "spec": {"deploymentPlan": {"size": 2}}});
        cluster.patch_interconnect("test", "r1", &patch).await.unwrap();

        let err = cluster.patch_interconnect("test", "r1", &patch).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));

        let stored = cluster.interconnect("test", "r1").unwrap();
        assert_eq!(stored.spec.deployment_plan.size, 2);
        assert_eq!(stored.metadata.generation, Some(2));
        assert_eq!(stored.metadata.uid.as_deref(), Some("r1-uid"));
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let cluster = FakeCluster::new();
        cluster.apply_interconnect(&sample_interconnect("r1", "interior", "Any", 1));
        let read = cluster.interconnect("test", "r1").unwrap();
        let rv = read.metadata.resource_version.as_deref();

        cluster.update_plan("test", "r1", json!({"size": 3}));

        let status = InterconnectStatus {
            pod_names: vec!["r1-0".into()],
            ..Default::default()
        };
        let err = cluster
            .patch_interconnect_status("test", "r1", rv, &status)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
        assert!(cluster.interconnect("test", "r1").unwrap().status.is_none());

        let fresh = cluster.interconnect("test", "r1").unwrap();
        let rv = fresh.metadata.resource_version.as_deref();
        cluster
            .patch_interconnect_status("test", "r1", rv, &status)
            .await
            .unwrap();
        let stored = cluster.interconnect("test", "r1").unwrap();
        assert_eq!(stored.status.unwrap().pod_names, vec!["r1-0".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_stalls_matching_calls() {
        let cluster = FakeCluster::new();
        cluster.delay_on("get Service", Duration::from_secs(5));

        let start = tokio::time::Instant::now();
        cluster.get_interconnect("test", "r1").await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        cluster.get_service("test", "r1").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let cluster = FakeCluster::new();
        cluster.fail_next("get Service", ClusterError::Conflict("injected".into()));
        assert!(cluster.get_service("test", "r1").await.is_err());
        assert!(cluster.get_service("test", "r1").await.unwrap().is_none());
        assert_eq!(cluster.calls().len(), 2);
    }
}
