//! # dynconf
//!
//! Coordinator-driven dynamic configuration changes for a multi-stripe
//! cluster:
//! - Per-node change log with a hash-chained history
//! - Two-phase change protocol (prepare everywhere, then commit)
//! - Discovery and consistency analysis across the cluster
//! - Repair of changes left half-way by a failed coordinator
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!        ┌──────────────────────────────┐
//!        │   dynconf (operator CLI)     │
//!        │  discover / prepare / commit │
//!        │  repair / wait-restart       │
//!        └──────────────┬───────────────┘
//!                       │ HTTP + JSON
//!   ┌───────────────────┼────────────────────┐
//!   │                   │                    │
//! ┌─▼───────────┐  ┌────▼────────┐  ┌────────▼────┐
//! │ node (pass.)│  │ node (pass.)│  │ node (act.) │
//! │ NomadServer │  │ NomadServer │  │ NomadServer │
//! │ + changelog │  │ + changelog │  │ + changelog │
//! └─────────────┘  └─────────────┘  └─────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! dynconf-node \
//!   --name node-1 \
//!   --bind 0.0.0.0:9410 \
//!   --repository ./node-1 \
//!   --topology ./cluster.toml
//! ```
//!
//! ### Drive the cluster
//! ```bash
//! dynconf activate --topology ./cluster.toml
//! dynconf set -s localhost:9410 -c offheap-resources.main=512
//! dynconf discover -s localhost:9410
//! dynconf repair -s localhost:9410 --force commit
//! ```

pub mod common;
pub mod coordinator;
pub mod model;
pub mod node;
pub mod ops;
pub mod protocol;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::Orchestrator;
pub use protocol::NomadServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
