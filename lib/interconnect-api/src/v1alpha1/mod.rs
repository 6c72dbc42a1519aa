/// API version v1alpha1 for Interconnect CRDs

pub mod interconnect;

pub use interconnect::{
    Condition, DeploymentPlan, Interconnect, InterconnectSpec, InterconnectStatus,
    ResourceOverrides,
};
