//! Core desired-state computation for Interconnect routers
//!
//! This library provides:
//! - Validation of deployment plans into closed role/placement enums
//! - The listener configuration generator for a router role
//! - The desired-state builder producing workload and service objects
//!
//! Nothing in this crate talks to the cluster API.

pub mod desired;
pub mod error;
pub mod listeners;
pub mod plan;

pub use desired::{DesiredState, Workload, WorkloadDescriptor, WorkloadKind};
pub use error::{Result, ValidationError};
pub use listeners::{ListenerEntry, ListenerRole};
pub use plan::{Placement, Role, ValidatedPlan};
