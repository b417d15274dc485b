//! Structural and capacity validation of a topology

use crate::common::{Error, Result};
use crate::model::topology::Cluster;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Checks that a topology is well-formed
pub struct ClusterValidator<'a> {
    cluster: &'a Cluster,
}

impl<'a> ClusterValidator<'a> {
    pub fn new(cluster: &'a Cluster) -> Self {
        Self { cluster }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.name.trim().is_empty() {
            return Err(Error::InvalidTopology("cluster name is empty".into()));
        }
        if self.cluster.stripes.is_empty() {
            return Err(Error::InvalidTopology("cluster has no stripe".into()));
        }

        let mut stripe_names = HashSet::new();
        let mut node_names = HashSet::new();
        let mut addresses = HashSet::new();
        for stripe in &self.cluster.stripes {
            if !stripe_names.insert(stripe.name.as_str()) {
                return Err(Error::InvalidTopology(format!(
                    "duplicate stripe name '{}'",
                    stripe.name
                )));
            }
            if stripe.nodes.is_empty() {
                return Err(Error::InvalidTopology(format!(
                    "stripe '{}' has no node",
                    stripe.name
                )));
            }
            for node in &stripe.nodes {
                if node.port == 0 {
                    return Err(Error::InvalidTopology(format!(
                        "node '{}' has no port",
                        node.name
                    )));
                }
                if !node_names.insert(node.name.as_str()) {
                    return Err(Error::InvalidTopology(format!(
                        "duplicate node name '{}'",
                        node.name
                    )));
                }
                if !addresses.insert(node.address()) {
                    return Err(Error::InvalidTopology(format!(
                        "duplicate node address {}",
                        node.address()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Resource limits a topology must stay within
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityLimits {
    /// Total offheap allowed across the cluster, in MB
    pub max_offheap_mb: Option<u64>,
}

/// Checks a topology against `CapacityLimits`
pub struct CapacityValidator<'a> {
    cluster: &'a Cluster,
    limits: &'a CapacityLimits,
}

impl<'a> CapacityValidator<'a> {
    pub fn new(cluster: &'a Cluster, limits: &'a CapacityLimits) -> Self {
        Self { cluster, limits }
    }

    pub fn validate(&self) -> Result<()> {
        let Some(limit) = self.limits.max_offheap_mb else {
            return Ok(());
        };

        let total = self.cluster.total_offheap_mb();
        if total > limit {
            return Err(Error::CapacityExceeded(format!(
                "cluster offheap is not within the limit: provided {} MB, but only {} MB allowed",
                total, limit
            )));
        }

        let stripes = self.cluster.stripes.len().max(1) as u64;
        let per_stripe = limit / stripes;
        let oversized = self
            .cluster
            .nodes()
            .flat_map(|n| n.offheap_resources.values())
            .find(|size| **size > per_stripe);
        if let Some(size) = oversized {
            return Err(Error::CapacityExceeded(format!(
                "stripe offheap is not within the per-stripe limit: provided {} MB, but only {} MB allowed",
                size, per_stripe
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::topology::{Node, Stripe};

    fn cluster(sizes: &[u64]) -> Cluster {
        let stripes = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| {
                Stripe::new(
                    format!("stripe-{}", i + 1),
                    vec![Node::new(format!("n{}", i + 1), format!("host{}", i + 1), 9410)
                        .with_offheap("main", *size)],
                )
            })
            .collect();
        Cluster::new("prod", stripes)
    }

    #[test]
    fn test_valid_cluster() {
        assert!(ClusterValidator::new(&cluster(&[128, 128])).validate().is_ok());
    }

    #[test]
    fn test_duplicate_address() {
        let mut c = cluster(&[128]);
        c.stripes[0].nodes.push(Node::new("other", "host1", 9410));
        let err = ClusterValidator::new(&c).validate().unwrap_err();
        assert!(err.to_string().contains("duplicate node address"));
    }

    #[test]
    fn test_empty_stripe() {
        let mut c = cluster(&[128]);
        c.stripes.push(Stripe::new("empty", vec![]));
        assert!(ClusterValidator::new(&c).validate().is_err());
    }

    #[test]
    fn test_capacity_limits() {
        let limits = CapacityLimits {
            max_offheap_mb: Some(1024),
        };
        assert!(CapacityValidator::new(&cluster(&[512, 512]), &limits)
            .validate()
            .is_ok());
        assert!(matches!(
            CapacityValidator::new(&cluster(&[512, 1024]), &limits).validate(),
            Err(Error::CapacityExceeded(_))
        ));
        // total fits but one stripe takes more than its share
        assert!(matches!(
            CapacityValidator::new(&cluster(&[700, 100]), &limits).validate(),
            Err(Error::CapacityExceeded(_))
        ));
        assert!(CapacityValidator::new(&cluster(&[4096]), &CapacityLimits::default())
            .validate()
            .is_ok());
    }
}
