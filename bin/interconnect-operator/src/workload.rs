//! Workload manager: idempotent ensure/remove of the objects owned by one
//! Interconnect.
//!
//! Objects are only ever patched where they differ from the desired state,
//! and only when they are controlled by the Interconnect being reconciled.
//! An object of the right name owned by anything else is reported as an
//! ownership conflict and left untouched.

use crate::cluster::ClusterClient;
use crate::error::ReconcileError;
use crate::metrics::Metrics;
use interconnect_core::{Workload, WorkloadKind};
use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

/// Result of ensuring one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Patched,
    Unchanged,
    /// The object is being deleted; it can only be recreated once it is gone
    Terminating,
}

/// Result of removing a workload kind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    /// No owned object of that kind exists
    Absent,
    /// Deleted and already gone
    Removed,
    /// Deletion requested but the object is still present
    Terminating,
}

pub struct WorkloadManager<'a> {
    cluster: &'a dyn ClusterClient,
    metrics: &'a Metrics,
    owner: OwnerReference,
    namespace: &'a str,
    name: &'a str,
}

impl<'a> WorkloadManager<'a> {
    pub fn new(
        cluster: &'a dyn ClusterClient,
        metrics: &'a Metrics,
        owner: OwnerReference,
        namespace: &'a str,
        name: &'a str,
    ) -> Self {
        Self {
            cluster,
            metrics,
            owner,
            namespace,
            name,
        }
    }

    /// Fetch the workload of `kind`, if it exists and is ours
    pub async fn observe(&self, kind: WorkloadKind) -> Result<Option<Workload>, ReconcileError> {
        let found = self
            .cluster
            .get_workload(kind, self.namespace, self.name)
            .await?;
        match found {
            Some(workload) => {
                self.check_owner(kind.api_kind(), workload.metadata())?;
                Ok(Some(workload))
            }
            None => Ok(None),
        }
    }

    /// Create the desired workload if absent, or patch the fields that differ
    pub async fn ensure(&self, desired: &Workload) -> Result<Applied, ReconcileError> {
        let kind = desired.kind();
        let api_kind = kind.api_kind();

        let Some(observed) = self.observe(kind).await? else {
            let mut workload = desired.clone();
            self.stamp_owner(workload.metadata_mut());
            self.cluster.create_workload(self.namespace, &workload).await?;
            self.metrics.record_write(api_kind, "create");
            info!(kind = api_kind, name = %self.name, "created workload");
            return Ok(Applied::Created);
        };

        if observed.is_terminating() {
            debug!(kind = api_kind, name = %self.name, "workload is terminating");
            return Ok(Applied::Terminating);
        }

        match workload_patch(&observed, desired)? {
            Some(patch) => {
                self.cluster
                    .patch_workload(kind, self.namespace, self.name, &patch)
                    .await?;
                self.metrics.record_write(api_kind, "patch");
                info!(kind = api_kind, name = %self.name, "patched workload");
                Ok(Applied::Patched)
            }
            None => Ok(Applied::Unchanged),
        }
    }

    /// Delete our workload of `kind`, if any. Only stale kinds are removed,
    /// so every delete issued here starts a workload kind transition.
    ///
    /// An object of that kind owned by someone else is not ours to remove and
    /// is ignored.
    pub async fn remove(&self, kind: WorkloadKind) -> Result<Removal, ReconcileError> {
        let api_kind = kind.api_kind();
        let observed = match self.observe(kind).await {
            Ok(observed) => observed,
            Err(ReconcileError::OwnershipConflict { .. }) => {
                debug!(kind = api_kind, name = %self.name, "ignoring foreign workload");
                return Ok(Removal::Absent);
            }
            Err(e) => return Err(e),
        };

        let Some(observed) = observed else {
            return Ok(Removal::Absent);
        };
        if observed.is_terminating() {
            return Ok(Removal::Terminating);
        }

        self.cluster
            .delete_workload(kind, self.namespace, self.name)
            .await?;
        self.metrics.record_write(api_kind, "delete");
        self.metrics.record_transition();
        info!(kind = api_kind, name = %self.name, "deleted stale workload");

        match self
            .cluster
            .get_workload(kind, self.namespace, self.name)
            .await?
        {
            Some(_) => Ok(Removal::Terminating),
            None => Ok(Removal::Removed),
        }
    }

    /// Create the desired service if absent, or patch the fields that differ
    pub async fn ensure_service(&self, desired: &Service) -> Result<Applied, ReconcileError> {
        let Some(observed) = self.cluster.get_service(self.namespace, self.name).await? else {
            let mut service = desired.clone();
            self.stamp_owner(&mut service.metadata);
            self.cluster.create_service(self.namespace, &service).await?;
            self.metrics.record_write("Service", "create");
            info!(name = %self.name, "created service");
            return Ok(Applied::Created);
        };

        self.check_owner("Service", &observed.metadata)?;

        if observed.metadata.deletion_timestamp.is_some() {
            return Ok(Applied::Terminating);
        }

        match service_patch(&observed, desired) {
            Some(patch) => {
                self.cluster
                    .patch_service(self.namespace, self.name, &patch)
                    .await?;
                self.metrics.record_write("Service", "patch");
                info!(name = %self.name, "patched service");
                Ok(Applied::Patched)
            }
            None => Ok(Applied::Unchanged),
        }
    }

    fn stamp_owner(&self, meta: &mut ObjectMeta) {
        meta.owner_references = Some(vec![self.owner.clone()]);
    }

    fn check_owner(&self, kind: &'static str, meta: &ObjectMeta) -> Result<(), ReconcileError> {
        if is_controlled_by(meta, &self.owner) {
            Ok(())
        } else {
            Err(ReconcileError::OwnershipConflict {
                kind,
                namespace: self.namespace.to_string(),
                name: self.name.to_string(),
            })
        }
    }
}

/// Whether `meta` names `owner` as its controller
pub fn is_controlled_by(meta: &ObjectMeta, owner: &OwnerReference) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && r.uid == owner.uid)
}

fn with_resource_version(observed: &ObjectMeta, spec: Map<String, Value>) -> Value {
    json!({
        "metadata": { "resourceVersion": observed.resource_version },
        "spec": spec,
    })
}

/// Merge patch moving `observed` to `desired`, or `None` if they match.
///
/// Replica count and pod template are compared independently, so a scale
/// change never rewrites the template. The template is rewritten when its
/// hash annotation differs or when any field the controller sets no longer
/// holds its desired value, such as a hand-edited container image.
pub fn workload_patch(
    observed: &Workload,
    desired: &Workload,
) -> Result<Option<Value>, serde_json::Error> {
    let mut spec = Map::new();

    if let Some(replicas) = desired.replicas() {
        if observed.replicas() != Some(replicas) {
            spec.insert("replicas".into(), json!(replicas));
        }
    }

    if let Some(template) = desired.template() {
        let desired_template = serde_json::to_value(template)?;
        let observed_template = match observed.template() {
            Some(t) => serde_json::to_value(t)?,
            None => Value::Null,
        };
        if observed.config_hash() != desired.config_hash()
            || !covers(&observed_template, &desired_template)
        {
            spec.insert("template".into(), desired_template);
        }
    }

    if spec.is_empty() {
        Ok(None)
    } else {
        Ok(Some(with_resource_version(observed.metadata(), spec)))
    }
}

/// Whether every field set in `desired` holds the same value in `observed`.
/// Fields only the server fills in are ignored; lists must match in length.
fn covers(observed: &Value, desired: &Value) -> bool {
    match (observed, desired) {
        (Value::Object(observed), Value::Object(desired)) => desired
            .iter()
            .all(|(k, v)| v.is_null() || observed.get(k).is_some_and(|o| covers(o, v))),
        (Value::Array(observed), Value::Array(desired)) => {
            observed.len() == desired.len()
                && observed.iter().zip(desired).all(|(o, d)| covers(o, d))
        }
        _ => observed == desired,
    }
}

/// Merge patch moving the observed service's ports, selector and type to
/// the desired ones, or `None` if they match
pub fn service_patch(observed: &Service, desired: &Service) -> Option<Value> {
    let observed_spec = observed.spec.clone().unwrap_or_default();
    let desired_spec = desired.spec.clone().unwrap_or_default();
    let mut spec = Map::new();

    let desired_ports = desired_spec.ports.unwrap_or_default();
    let observed_ports = observed_spec.ports.unwrap_or_default();
    if port_keys(&observed_ports) != port_keys(&desired_ports) {
        spec.insert("ports".into(), json!(desired_ports));
    }

    if observed_spec.selector != desired_spec.selector {
        spec.insert("selector".into(), json!(desired_spec.selector));
    }

    let observed_type = observed_spec.type_.as_deref().unwrap_or("ClusterIP");
    if let Some(desired_type) = desired_spec.type_.as_deref() {
        if observed_type != desired_type {
            spec.insert("type".into(), json!(desired_type));
        }
    }

    if spec.is_empty() {
        None
    } else {
        Some(with_resource_version(&observed.metadata, spec))
    }
}

/// Fields of a service port this controller manages, with server defaults
/// filled in
fn port_keys(ports: &[ServicePort]) -> Vec<(Option<String>, i32, IntOrString, String)> {
    ports
        .iter()
        .map(|p| {
            (
                p.name.clone(),
                p.port,
                p.target_port.clone().unwrap_or(IntOrString::Int(p.port)),
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            )
        })
        .collect()
}
