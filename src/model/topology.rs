//! Cluster topology: stripes of nodes plus cluster-wide settings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A node of a stripe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    /// Offheap resources: resource name -> size in MB
    #[serde(default)]
    pub offheap_resources: BTreeMap<String, u64>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl Node {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            port,
            offheap_resources: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }

    pub fn with_offheap(mut self, resource: impl Into<String>, size_mb: u64) -> Self {
        self.offheap_resources.insert(resource.into(), size_mb);
        self
    }

    /// Address used to reach the node (`host:port`)
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn total_offheap_mb(&self) -> u64 {
        self.offheap_resources.values().sum()
    }
}

/// A replication group: one active and its passives at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Stripe {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.nodes.iter().any(|n| n.address() == address)
    }
}

/// Cluster topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub stripes: Vec<Stripe>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, stripes: Vec<Stripe>) -> Self {
        Self {
            name: name.into(),
            stripes,
            settings: BTreeMap::new(),
        }
    }

    /// Read a topology document (TOML or JSON, picked by extension)
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.stripes.iter().flat_map(|s| s.nodes.iter())
    }

    pub fn node_addresses(&self) -> Vec<String> {
        self.nodes().map(Node::address).collect()
    }

    pub fn contains_node(&self, address: &str) -> bool {
        self.stripes.iter().any(|s| s.contains(address))
    }

    pub fn find_node(&self, address: &str) -> Option<&Node> {
        self.nodes().find(|n| n.address() == address)
    }

    pub fn find_node_mut(&mut self, address: &str) -> Option<&mut Node> {
        self.stripes
            .iter_mut()
            .flat_map(|s| s.nodes.iter_mut())
            .find(|n| n.address() == address)
    }

    pub fn stripe(&self, name: &str) -> Option<&Stripe> {
        self.stripes.iter().find(|s| s.name == name)
    }

    pub fn stripe_mut(&mut self, name: &str) -> Option<&mut Stripe> {
        self.stripes.iter_mut().find(|s| s.name == name)
    }

    pub fn total_offheap_mb(&self) -> u64 {
        self.nodes().map(Node::total_offheap_mb).sum()
    }
}
