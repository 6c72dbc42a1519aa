use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Interconnect describes a desired deployment of message routers.
///
/// `role` and `placement` are kept as plain strings on the wire so that a
/// malformed value still reaches the controller, which reports it as a
/// condition instead of the object silently failing to deserialize.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "interconnectedcloud.github.io",
    version = "v1alpha1",
    kind = "Interconnect",
    plural = "interconnects",
    namespaced,
    derive = "Default",
    derive = "PartialEq",
    status = "InterconnectStatus",
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.deploymentPlan.role"}"#,
    printcolumn = r#"{"name":"Placement","type":"string","jsonPath":".spec.deploymentPlan.placement"}"#,
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".spec.deploymentPlan.size"}"#,
    printcolumn = r#"{"name":"Workload","type":"string","jsonPath":".status.workloadKind"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InterconnectSpec {
    /// How and where the routers are deployed
    #[serde(default)]
    pub deployment_plan: DeploymentPlan,
}

/// Deployment plan for an Interconnect
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPlan {
    /// Router role: "interior" or "edge" (defaults to "interior")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Placement: "Any" or "Every" (defaults to "Any")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,

    /// Number of router instances for "Any" placement; 0 means the default of 1
    #[serde(default)]
    pub size: i32,

    /// Router image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Resource requirements passed through to the router container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceOverrides>,

    /// HTTP port probed for liveness (defaults to 8888)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_port: Option<i32>,

    /// Type of the exposed service (defaults to "ClusterIP")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

/// Container resource limits and requests, as quantity strings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceOverrides {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

/// Status of an Interconnect
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InterconnectStatus {
    /// Conditions describing the status
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Names of the router pods selected by the workload
    #[serde(default)]
    pub pod_names: Vec<String>,

    /// Kind of the workload currently backing this Interconnect.
    /// Serialized as null when unset so a merge patch clears it.
    #[serde(default)]
    pub workload_kind: Option<String>,

    /// Generation of the spec this status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl InterconnectStatus {
    /// Find a condition by type
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// Condition for Interconnect status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status: "True", "False", "Unknown"
    pub status: String,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time status or reason changed (RFC 3339)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}
