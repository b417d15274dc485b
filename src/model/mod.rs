//! Topology model and the changes that can be applied to it

pub mod change;
pub mod topology;
pub mod validation;

pub use change::{Change, SettingOp, SettingTarget};
pub use topology::{Cluster, Node, Stripe};
pub use validation::{CapacityLimits, CapacityValidator, ClusterValidator};
