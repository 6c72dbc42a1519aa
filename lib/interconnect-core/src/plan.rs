//! Deployment plan validation
//!
//! The wire form of a deployment plan carries role and placement as strings.
//! They are parsed here into closed enums; nothing past this module sees the
//! raw strings.

use crate::{Result, ValidationError};
use interconnect_api::{DeploymentPlan, ResourceOverrides};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

/// Replica count used when a plan asks for size 0
pub const DEFAULT_SIZE: i32 = 1;
/// Router image used when the plan does not override it
pub const DEFAULT_IMAGE: &str = "quay.io/interconnectedcloud/qdrouterd:1.8.0";
/// Port probed for liveness when the plan does not override it
pub const DEFAULT_LIVENESS_PORT: i32 = 8888;
/// Service type used when the plan does not override it
pub const DEFAULT_SERVICE_TYPE: &str = "ClusterIP";

const SERVICE_TYPES: [&str; 3] = ["ClusterIP", "NodePort", "LoadBalancer"];

/// Role of a router within the network
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Role {
    #[default]
    Interior,
    Edge,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Interior => "interior",
            Role::Edge => "edge",
        }
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "interior" => Ok(Role::Interior),
            "edge" => Ok(Role::Edge),
            other => Err(ValidationError::InvalidRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where router instances are scheduled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Placement {
    /// A scalable group sized by the plan
    #[default]
    Any,
    /// One instance per eligible node
    Every,
}

impl Placement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Placement::Any => "Any",
            Placement::Every => "Every",
        }
    }
}

impl FromStr for Placement {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Any" => Ok(Placement::Any),
            "Every" => Ok(Placement::Every),
            other => Err(ValidationError::InvalidPlacement(other.to_string())),
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployment plan whose every field has been checked and defaulted
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedPlan {
    pub role: Role,
    pub placement: Placement,
    /// Requested size as written; 0 is the "use the default" sentinel
    pub size: i32,
    pub image: String,
    pub resources: Option<ResourceOverrides>,
    pub liveness_port: i32,
    pub service_type: String,
}

impl ValidatedPlan {
    /// Validate a wire-form plan. Unset or empty strings take their defaults.
    pub fn from_plan(plan: &DeploymentPlan) -> Result<Self> {
        let role = match non_empty(&plan.role) {
            Some(role) => role.parse()?,
            None => Role::default(),
        };
        let placement = match non_empty(&plan.placement) {
            Some(placement) => placement.parse()?,
            None => Placement::default(),
        };

        if plan.size < 0 {
            return Err(ValidationError::NegativeSize(plan.size));
        }

        let liveness_port = plan.liveness_port.unwrap_or(DEFAULT_LIVENESS_PORT);
        if !(1..=65535).contains(&liveness_port) {
            return Err(ValidationError::InvalidLivenessPort(liveness_port));
        }

        let service_type = match non_empty(&plan.service_type) {
            Some(t) if SERVICE_TYPES.contains(&t) => t.to_string(),
            Some(t) => return Err(ValidationError::InvalidServiceType(t.to_string())),
            None => DEFAULT_SERVICE_TYPE.to_string(),
        };

        Ok(Self {
            role,
            placement,
            size: plan.size,
            image: non_empty(&plan.image).unwrap_or(DEFAULT_IMAGE).to_string(),
            resources: plan.resources.clone(),
            liveness_port,
            service_type,
        })
    }

    /// Replica count for a scaled group
    pub fn effective_size(&self) -> i32 {
        if self.size == 0 {
            DEFAULT_SIZE
        } else {
            self.size
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Merge patch writing defaulted role, placement and size back into a plan.
///
/// Returns `None` when the stored plan already spells out all three.
pub fn defaults_patch(plan: &DeploymentPlan) -> Option<Value> {
    let mut fields = Map::new();
    if non_empty(&plan.role).is_none() {
        fields.insert("role".into(), json!(Role::default().as_str()));
    }
    if non_empty(&plan.placement).is_none() {
        fields.insert("placement".into(), json!(Placement::default().as_str()));
    }
    if plan.size == 0 {
        fields.insert("size".into(), json!(DEFAULT_SIZE));
    }

    if fields.is_empty() {
        None
    } else {
        Some(json!({ "spec": { "deploymentPlan": fields } }))
    }
}
