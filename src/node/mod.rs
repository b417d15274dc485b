//! Node daemon: startup, capability registry and the HTTP protocol surface

pub mod client;
pub mod http;
pub mod registry;
pub mod server;
pub mod startup;

pub use client::HttpNodeClient;
pub use http::{create_router, startup_router, NodeState};
pub use registry::{Capability, CapabilityRegistry, Registration};
pub use server::{build_router, logical_state_of, NodeDaemon};
pub use startup::{start_node, NodeRuntime, StartupOptions, StartupStrategy, STARTUP_STRATEGIES};
