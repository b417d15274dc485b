//! Configuration changes
//!
//! A `Change` is a pure function over the topology: `apply` never
//! touches anything outside the cluster value it is handed, so running it
//! twice on the same input yields the same result.

use crate::common::{Error, Result};
use crate::model::topology::{Cluster, Node, Stripe};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingOp {
    Set,
    Unset,
}

/// Where a setting lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "address", rename_all = "snake_case")]
pub enum SettingTarget {
    Cluster,
    Node(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    /// Initial configuration of unconfigured nodes
    ClusterActivation { cluster: Cluster },
    NodeAddition { stripe: String, node: Node },
    NodeRemoval { stripe: String, address: String },
    StripeAddition { stripe: Stripe },
    StripeRemoval { stripe: String },
    SettingChange {
        op: SettingOp,
        target: SettingTarget,
        name: String,
        value: Option<String>,
    },
    /// Several changes applied in order as one
    Batch { changes: Vec<Change> },
}

impl Change {
    /// Compute the topology resulting from this change
    pub fn apply(&self, current: Option<&Cluster>) -> Result<Cluster> {
        match self {
            Change::ClusterActivation { cluster } => match current {
                None => Ok(cluster.clone()),
                Some(existing) => Err(Error::InvalidChange(format!(
                    "node is already part of cluster '{}'",
                    existing.name
                ))),
            },
            Change::Batch { changes } => {
                let mut cluster = current.cloned();
                for change in changes {
                    cluster = Some(change.apply(cluster.as_ref())?);
                }
                cluster.ok_or_else(|| Error::InvalidChange("empty batch".into()))
            }
            _ => {
                let cluster = current
                    .cloned()
                    .ok_or_else(|| Error::InvalidChange("node is not activated".into()))?;
                self.apply_to(cluster)
            }
        }
    }

    fn apply_to(&self, mut cluster: Cluster) -> Result<Cluster> {
        match self {
            Change::NodeAddition { stripe, node } => {
                let address = node.address();
                if cluster.contains_node(&address) {
                    return Err(Error::InvalidChange(format!(
                        "node {} is already part of the cluster",
                        address
                    )));
                }
                cluster
                    .stripe_mut(stripe)
                    .ok_or_else(|| Error::InvalidChange(format!("no stripe named '{}'", stripe)))?
                    .nodes
                    .push(node.clone());
            }
            Change::NodeRemoval { stripe, address } => {
                let target = cluster
                    .stripe_mut(stripe)
                    .ok_or_else(|| Error::InvalidChange(format!("no stripe named '{}'", stripe)))?;
                let before = target.nodes.len();
                target.nodes.retain(|n| n.address() != *address);
                if target.nodes.len() == before {
                    return Err(Error::InvalidChange(format!(
                        "node {} is not part of stripe '{}'",
                        address, stripe
                    )));
                }
            }
            Change::StripeAddition { stripe } => {
                if cluster.stripe(&stripe.name).is_some() {
                    return Err(Error::InvalidChange(format!(
                        "stripe '{}' already exists",
                        stripe.name
                    )));
                }
                cluster.stripes.push(stripe.clone());
            }
            Change::StripeRemoval { stripe } => {
                let before = cluster.stripes.len();
                cluster.stripes.retain(|s| s.name != *stripe);
                if cluster.stripes.len() == before {
                    return Err(Error::InvalidChange(format!("no stripe named '{}'", stripe)));
                }
            }
            Change::SettingChange {
                op,
                target,
                name,
                value,
            } => {
                let settings = match target {
                    SettingTarget::Cluster => &mut cluster.settings,
                    SettingTarget::Node(address) => {
                        &mut cluster
                            .find_node_mut(address)
                            .ok_or_else(|| {
                                Error::InvalidChange(format!("unknown node {}", address))
                            })?
                            .settings
                    }
                };
                match (op, value) {
                    (SettingOp::Set, Some(value)) => {
                        settings.insert(name.clone(), value.clone());
                    }
                    (SettingOp::Set, None) => {
                        return Err(Error::InvalidChange(format!(
                            "setting '{}' needs a value",
                            name
                        )))
                    }
                    (SettingOp::Unset, _) => {
                        settings.remove(name);
                    }
                }
            }
            Change::ClusterActivation { .. } | Change::Batch { .. } => {
                return self.apply(Some(&cluster));
            }
        }

        Ok(cluster)
    }

    /// Human-readable one-liner
    pub fn summary(&self) -> String {
        match self {
            Change::ClusterActivation { cluster } => format!(
                "Activating cluster '{}' ({} stripe(s), {} node(s))",
                cluster.name,
                cluster.stripes.len(),
                cluster.nodes().count()
            ),
            Change::NodeAddition { stripe, node } => format!(
                "Attaching node {} ({}) to stripe '{}'",
                node.address(),
                node.name,
                stripe
            ),
            Change::NodeRemoval { stripe, address } => {
                format!("Detaching node {} from stripe '{}'", address, stripe)
            }
            Change::StripeAddition { stripe } => format!(
                "Attaching stripe '{}' with {} node(s)",
                stripe.name,
                stripe.nodes.len()
            ),
            Change::StripeRemoval { stripe } => format!("Detaching stripe '{}'", stripe),
            Change::SettingChange {
                op,
                target,
                name,
                value,
            } => {
                let scope = match target {
                    SettingTarget::Cluster => "cluster".to_string(),
                    SettingTarget::Node(address) => format!("node {}", address),
                };
                match (op, value) {
                    (SettingOp::Set, Some(value)) => format!("set {}={} on {}", name, value, scope),
                    _ => format!("unset {} on {}", name, scope),
                }
            }
            Change::Batch { changes } => changes
                .iter()
                .map(Change::summary)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Does committing this change alter the set of running nodes?
    pub fn is_topology_change(&self) -> bool {
        match self {
            Change::SettingChange { .. } => false,
            Change::Batch { changes } => changes.iter().any(Change::is_topology_change),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Cluster {
        Cluster::new(
            "prod",
            vec![Stripe::new("stripe-1", vec![Node::new("n1", "host1", 9410)])],
        )
    }

    #[test]
    fn test_activation_requires_unconfigured_node() {
        let change = Change::ClusterActivation { cluster: base() };
        assert_eq!(change.apply(None).unwrap(), base());
        assert!(change.apply(Some(&base())).is_err());
    }

    #[test]
    fn test_node_addition_is_pure() {
        let change = Change::NodeAddition {
            stripe: "stripe-1".into(),
            node: Node::new("n2", "host2", 9410),
        };
        let current = base();
        let first = change.apply(Some(&current)).unwrap();
        let second = change.apply(Some(&current)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.stripes[0].nodes.len(), 2);
        assert_eq!(current.stripes[0].nodes.len(), 1);

        // applying on top of the result is a duplicate
        assert!(change.apply(Some(&first)).is_err());
    }

    #[test]
    fn test_node_removal() {
        let change = Change::NodeRemoval {
            stripe: "stripe-1".into(),
            address: "host1:9410".into(),
        };
        let after = change.apply(Some(&base())).unwrap();
        assert!(after.stripes[0].nodes.is_empty());

        let missing = Change::NodeRemoval {
            stripe: "stripe-1".into(),
            address: "host9:9410".into(),
        };
        assert!(missing.apply(Some(&base())).is_err());
    }

    #[test]
    fn test_stripe_changes() {
        let add = Change::StripeAddition {
            stripe: Stripe::new("stripe-2", vec![Node::new("n3", "host3", 9410)]),
        };
        let after = add.apply(Some(&base())).unwrap();
        assert_eq!(after.stripes.len(), 2);
        assert!(add.apply(Some(&after)).is_err());

        let remove = Change::StripeRemoval {
            stripe: "stripe-2".into(),
        };
        assert_eq!(remove.apply(Some(&after)).unwrap(), base());
    }

    #[test]
    fn test_setting_change() {
        let set = Change::SettingChange {
            op: SettingOp::Set,
            target: SettingTarget::Node("host1:9410".into()),
            name: "log-dir".into(),
            value: Some("/var/log".into()),
        };
        let after = set.apply(Some(&base())).unwrap();
        assert_eq!(
            after.find_node("host1:9410").unwrap().settings["log-dir"],
            "/var/log"
        );
        assert_eq!(set.summary(), "set log-dir=/var/log on node host1:9410");
        assert!(!set.is_topology_change());

        let unset = Change::SettingChange {
            op: SettingOp::Unset,
            target: SettingTarget::Node("host1:9410".into()),
            name: "log-dir".into(),
            value: None,
        };
        assert_eq!(unset.apply(Some(&after)).unwrap(), base());
    }

    #[test]
    fn test_batch_applies_in_order() {
        let batch = Change::Batch {
            changes: vec![
                Change::ClusterActivation { cluster: base() },
                Change::NodeAddition {
                    stripe: "stripe-1".into(),
                    node: Node::new("n2", "host2", 9410),
                },
            ],
        };
        let after = batch.apply(None).unwrap();
        assert_eq!(after.stripes[0].nodes.len(), 2);
        assert!(batch.summary().contains(", Attaching node host2:9410"));
    }

    #[test]
    fn test_serde_tagging() {
        let change = Change::StripeRemoval {
            stripe: "stripe-2".into(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["type"], "stripe_removal");
        let back: Change = serde_json::from_value(json).unwrap();
        assert_eq!(back, change);
    }
}
