//! Common utilities and types shared across dynconf

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{Config, CoordinatorConfig, NodeConfig, NodeRole, SyncPolicy};
pub use error::{Error, Result};
pub use hash::{blake3_hash, chain_hash, hash_json, HASH_LEN};
pub use utils::{crc32, local_host, local_user, parse_duration, LogicalServerState};
