//! Desired-state builder
//!
//! Turns a validated Interconnect into the objects that should exist in the
//! cluster: exactly one workload (a Deployment for "Any" placement or a
//! DaemonSet for "Every") plus a Service exposing the router listeners.

use crate::listeners::{listeners_for, render_router_config, ListenerEntry};
use crate::plan::{Placement, Role, ValidatedPlan};
use crate::{Result, ValidationError};
use interconnect_api::{Interconnect, ResourceOverrides};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Pod template annotation carrying the hash of the generated template
pub const CONFIG_HASH_ANNOTATION: &str = "interconnectedcloud.github.io/config-hash";
pub const APPLICATION_LABEL: &str = "application";
pub const CR_LABEL: &str = "interconnect_cr";

/// The two workload kinds an Interconnect can be backed by
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    ScaledGroup,
    PerNodeGroup,
}

impl WorkloadKind {
    /// Kubernetes kind implementing this workload
    pub fn api_kind(&self) -> &'static str {
        match self {
            WorkloadKind::ScaledGroup => "Deployment",
            WorkloadKind::PerNodeGroup => "DaemonSet",
        }
    }

    pub fn other(&self) -> WorkloadKind {
        match self {
            WorkloadKind::ScaledGroup => WorkloadKind::PerNodeGroup,
            WorkloadKind::PerNodeGroup => WorkloadKind::ScaledGroup,
        }
    }
}

/// Target workload shape for a plan
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadDescriptor {
    ScaledGroup { replicas: i32 },
    PerNodeGroup,
}

impl WorkloadDescriptor {
    pub fn for_plan(plan: &ValidatedPlan) -> Self {
        match plan.placement {
            Placement::Every => WorkloadDescriptor::PerNodeGroup,
            Placement::Any => WorkloadDescriptor::ScaledGroup {
                replicas: plan.effective_size(),
            },
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        match self {
            WorkloadDescriptor::ScaledGroup { .. } => WorkloadKind::ScaledGroup,
            WorkloadDescriptor::PerNodeGroup => WorkloadKind::PerNodeGroup,
        }
    }
}

/// A concrete workload object, desired or observed
#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    ScaledGroup(Deployment),
    PerNodeGroup(DaemonSet),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::ScaledGroup(_) => WorkloadKind::ScaledGroup,
            Workload::PerNodeGroup(_) => WorkloadKind::PerNodeGroup,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::ScaledGroup(d) => &d.metadata,
            Workload::PerNodeGroup(ds) => &ds.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Workload::ScaledGroup(d) => &mut d.metadata,
            Workload::PerNodeGroup(ds) => &mut ds.metadata,
        }
    }

    /// Replica count; `None` for per-node groups
    pub fn replicas(&self) -> Option<i32> {
        match self {
            Workload::ScaledGroup(d) => d.spec.as_ref().and_then(|s| s.replicas),
            Workload::PerNodeGroup(_) => None,
        }
    }

    pub fn template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Workload::ScaledGroup(d) => d.spec.as_ref().map(|s| &s.template),
            Workload::PerNodeGroup(ds) => ds.spec.as_ref().map(|s| &s.template),
        }
    }

    /// Config hash recorded on the pod template, if any
    pub fn config_hash(&self) -> Option<&str> {
        self.template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(CONFIG_HASH_ANNOTATION))
            .map(String::as_str)
    }

    /// Whether deletion of this object has been requested
    pub fn is_terminating(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }
}

/// Everything that should exist for one Interconnect
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredState {
    pub name: String,
    pub namespace: String,
    pub plan: ValidatedPlan,
    pub descriptor: WorkloadDescriptor,
    pub listeners: Vec<ListenerEntry>,
    pub labels: BTreeMap<String, String>,
    pub config_hash: String,
    pub pod_template: PodTemplateSpec,
    pub service: Service,
}

impl DesiredState {
    /// Build the desired state for an Interconnect.
    ///
    /// Fails only on validation; never touches the cluster.
    pub fn build(interconnect: &Interconnect) -> Result<Self> {
        let name = interconnect
            .metadata
            .name
            .clone()
            .ok_or(ValidationError::MissingObjectKey(".metadata.name"))?;
        let namespace = interconnect
            .metadata
            .namespace
            .clone()
            .ok_or(ValidationError::MissingObjectKey(".metadata.namespace"))?;

        let plan = ValidatedPlan::from_plan(&interconnect.spec.deployment_plan)?;
        let descriptor = WorkloadDescriptor::for_plan(&plan);
        let listeners = listeners_for(plan.role);
        let labels = selector_labels(&name);

        let mut pod_template = pod_template(&name, &plan, &listeners, &labels);
        let config_hash = template_hash(&pod_template);
        pod_template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(CONFIG_HASH_ANNOTATION.to_string(), config_hash.clone());

        let service = service(&name, &namespace, &plan, &listeners, &labels);

        Ok(Self {
            name,
            namespace,
            plan,
            descriptor,
            listeners,
            labels,
            config_hash,
            pod_template,
            service,
        })
    }

    pub fn kind(&self) -> WorkloadKind {
        self.descriptor.kind()
    }

    /// The workload object matching the descriptor
    pub fn workload(&self) -> Workload {
        let metadata = self.object_meta();
        let selector = LabelSelector {
            match_labels: Some(self.labels.clone()),
            ..Default::default()
        };

        match self.descriptor {
            WorkloadDescriptor::ScaledGroup { replicas } => Workload::ScaledGroup(Deployment {
                metadata,
                spec: Some(DeploymentSpec {
                    replicas: Some(replicas),
                    selector,
                    template: self.pod_template.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            WorkloadDescriptor::PerNodeGroup => Workload::PerNodeGroup(DaemonSet {
                metadata,
                spec: Some(DaemonSetSpec {
                    selector,
                    template: self.pod_template.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    /// Label selector string matching the router pods
    pub fn pod_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn object_meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels.clone()),
            ..Default::default()
        }
    }
}

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APPLICATION_LABEL.to_string(), name.to_string()),
        (CR_LABEL.to_string(), name.to_string()),
    ])
}

fn pod_template(
    name: &str,
    plan: &ValidatedPlan,
    listeners: &[ListenerEntry],
    labels: &BTreeMap<String, String>,
) -> PodTemplateSpec {
    let ports = listeners
        .iter()
        .map(|l| ContainerPort {
            name: Some(l.name.to_string()),
            container_port: i32::from(l.port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: name.to_string(),
        image: Some(plan.image.clone()),
        env: Some(env_vars(name, plan.role, listeners)),
        ports: Some(ports),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::Int(plan.liveness_port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(60),
            ..Default::default()
        }),
        resources: plan.resources.as_ref().map(resource_requirements),
        ..Default::default()
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            ..Default::default()
        }),
    }
}

fn env_vars(name: &str, role: Role, listeners: &[ListenerEntry]) -> Vec<EnvVar> {
    let field_ref = |path: &str| EnvVarSource {
        field_ref: Some(ObjectFieldSelector {
            field_path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut env = vec![
        EnvVar {
            name: "APPLICATION_NAME".to_string(),
            value: Some(name.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "POD_NAMESPACE".to_string(),
            value_from: Some(field_ref("metadata.namespace")),
            ..Default::default()
        },
        EnvVar {
            name: "POD_IP".to_string(),
            value_from: Some(field_ref("status.podIP")),
            ..Default::default()
        },
        EnvVar {
            name: "QDROUTERD_CONF".to_string(),
            value: Some(render_router_config(role, listeners)),
            ..Default::default()
        },
    ];

    if role == Role::Interior {
        env.push(EnvVar {
            name: "QDROUTERD_AUTO_MESH_DISCOVERY".to_string(),
            value: Some("QUERY".to_string()),
            ..Default::default()
        });
    }

    env
}

fn resource_requirements(overrides: &ResourceOverrides) -> ResourceRequirements {
    let quantities = |m: &BTreeMap<String, String>| {
        if m.is_empty() {
            None
        } else {
            Some(
                m.iter()
                    .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                    .collect(),
            )
        }
    };

    ResourceRequirements {
        limits: quantities(&overrides.limits),
        requests: quantities(&overrides.requests),
        ..Default::default()
    }
}

fn service(
    name: &str,
    namespace: &str,
    plan: &ValidatedPlan,
    listeners: &[ListenerEntry],
    labels: &BTreeMap<String, String>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels.clone()),
            ports: Some(service_ports(listeners)),
            type_: Some(plan.service_type.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service ports mirroring the listener set, in listener order
pub fn service_ports(listeners: &[ListenerEntry]) -> Vec<ServicePort> {
    listeners
        .iter()
        .map(|l| ServicePort {
            name: Some(l.name.to_string()),
            port: i32::from(l.port),
            target_port: Some(IntOrString::Int(i32::from(l.port))),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect()
}

fn template_hash(template: &PodTemplateSpec) -> String {
    // Serializing a PodTemplateSpec is infallible: no non-string map keys
    let bytes = serde_json::to_vec(template).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
