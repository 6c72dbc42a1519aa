//! Interconnect API types and CRDs for Kubernetes integration
//!
//! This library defines the custom resource reconciled by the interconnect operator:
//! - Interconnect: a declarative deployment plan for a fleet of message routers

pub mod v1alpha1;

pub use v1alpha1::{
    Condition, DeploymentPlan, Interconnect, InterconnectSpec, InterconnectStatus,
    ResourceOverrides,
};
