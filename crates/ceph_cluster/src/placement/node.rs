use k8s_openapi::api::core::v1::{Node, NodeSelectorRequirement, NodeSelectorTerm, Taint, Toleration};
use std::collections::BTreeMap;
use tracing::debug;

use crate::{
    api::v1::cephcluster::Placement,
    cluster_info::NodeInfo,
    util::errors::{Error, Result, StdError},
};

pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Why a node cannot host a daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Unschedulable,
    NotReady,
    AffinityMismatch,
    UntoleratedTaint(String),
}

/// Checks schedulability, readiness, required node affinity and taints
pub fn validate_node(node: &Node, placement: &Placement) -> std::result::Result<(), Rejection> {
    if node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false) {
        return Err(Rejection::Unschedulable);
    }
    if !node_is_ready(node) {
        return Err(Rejection::NotReady);
    }
    if !node_meets_affinity(node, placement) {
        return Err(Rejection::AffinityMismatch);
    }
    let tolerations = placement.tolerations.as_deref().unwrap_or_default();
    let taints = node.spec.as_ref().and_then(|s| s.taints.as_deref()).unwrap_or_default();
    for taint in taints {
        // PreferNoSchedule never keeps a pod off a node
        if taint.effect != "NoSchedule" && taint.effect != "NoExecute" {
            continue;
        }
        if !tolerations.iter().any(|t| tolerates(t, taint)) {
            return Err(Rejection::UntoleratedTaint(taint.key.clone()));
        }
    }
    Ok(())
}

pub fn valid_node(node: &Node, placement: &Placement) -> bool {
    match validate_node(node, placement) {
        Ok(()) => true,
        Err(reason) => {
            debug!("skipping node {}: {:?}", node_name(node), reason);
            false
        }
    }
}

pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

pub fn node_label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata.labels.as_ref()?.get(key).map(String::as_str)
}

pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

fn node_meets_affinity(node: &Node, placement: &Placement) -> bool {
    let Some(required) = placement
        .node_affinity
        .as_ref()
        .and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref())
    else {
        return true;
    };
    let empty = BTreeMap::new();
    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
    required
        .node_selector_terms
        .iter()
        .any(|term| term_matches(term, labels, node_name(node)))
}

/// Terms without requirements match nothing
fn term_matches(term: &NodeSelectorTerm, labels: &BTreeMap<String, String>, name: &str) -> bool {
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();
    if expressions.is_empty() && fields.is_empty() {
        return false;
    }
    let fields_ok = fields.iter().all(|r| {
        let value = (r.key == "metadata.name").then_some(name);
        requirement_matches(r, value)
    });
    fields_ok
        && expressions
            .iter()
            .all(|r| requirement_matches(r, labels.get(&r.key).map(String::as_str)))
}

fn requirement_matches(req: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.iter().any(|x| x == v)),
        "NotIn" => value.map_or(true, |v| !values.iter().any(|x| x == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        "Gt" | "Lt" => {
            let (Some(actual), Some(bound)) = (
                value.and_then(|v| v.parse::<i64>().ok()),
                values.first().and_then(|v| v.parse::<i64>().ok()),
            ) else {
                return false;
            };
            if req.operator == "Gt" {
                actual > bound
            } else {
                actual < bound
            }
        }
        other => {
            debug!("unknown node selector operator {}", other);
            false
        }
    }
}

/// Same matching rules the scheduler applies
pub fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref().filter(|e| !e.is_empty()) {
        if effect != taint.effect {
            return false;
        }
    }
    if let Some(key) = toleration.key.as_deref().filter(|k| !k.is_empty()) {
        if key != taint.key {
            return false;
        }
    }
    match toleration.operator.as_deref().unwrap_or("Equal") {
        "Exists" => true,
        "Equal" | "" => toleration.value.as_deref().unwrap_or_default()
            == taint.value.as_deref().unwrap_or_default(),
        _ => false,
    }
}

/// Name, hostname label and the address mons on host networking bind to
pub fn node_info(node: &Node) -> Result<NodeInfo> {
    let name = node_name(node).to_string();
    let addresses = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_deref())
        .unwrap_or_default();
    let address = ["ExternalIP", "InternalIP"]
        .iter()
        .find_map(|kind| addresses.iter().find(|a| a.type_ == *kind))
        .map(|a| a.address.clone())
        .ok_or_else(|| {
            Error::StdError(StdError::NoNodesAvailable(format!(
                "couldn't get IP of node {name}"
            )))
        })?;
    let hostname = node_label(node, HOSTNAME_LABEL)
        .map(str::to_string)
        .unwrap_or_else(|| name.clone());
    Ok(NodeInfo {
        name,
        hostname,
        address,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        NodeAddress, NodeAffinity, NodeCondition, NodeSelector, NodeSpec, NodeStatus,
    };
    use kube::api::ObjectMeta;

    pub fn node(name: &str, labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(crate::util::k8s::labels(labels)),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".into(),
                    address: format!("10.0.0.{}", name.len()),
                }]),
                ..Default::default()
            }),
        }
    }

    fn affinity(key: &str, operator: &str, values: &[&str]) -> Placement {
        Placement {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: key.into(),
                            operator: operator.into(),
                            values: Some(values.iter().map(|v| v.to_string()).collect()),
                        }]),
                        match_fields: None,
                    }],
                }),
                ..Default::default()
            }),
            tolerations: None,
        }
    }

    #[test]
    fn cordoned_and_not_ready_nodes_are_rejected() {
        let placement = Placement::default();
        let mut cordoned = node("n1", &[]);
        cordoned.spec.as_mut().unwrap().unschedulable = Some(true);
        assert_eq!(validate_node(&cordoned, &placement), Err(Rejection::Unschedulable));

        let mut not_ready = node("n2", &[]);
        not_ready.status.as_mut().unwrap().conditions.as_mut().unwrap()[0].status = "False".into();
        assert_eq!(validate_node(&not_ready, &placement), Err(Rejection::NotReady));

        assert!(valid_node(&node("n3", &[]), &placement));
    }

    #[test]
    fn required_affinity_operators() {
        let storage = node("n1", &[("role", "storage"), ("disks", "4")]);
        assert!(valid_node(&storage, &affinity("role", "In", &["storage", "mon"])));
        assert!(!valid_node(&storage, &affinity("role", "NotIn", &["storage"])));
        assert!(valid_node(&storage, &affinity("role", "Exists", &[])));
        assert!(!valid_node(&storage, &affinity("role", "DoesNotExist", &[])));
        assert!(valid_node(&storage, &affinity("disks", "Gt", &["3"])));
        assert!(!valid_node(&storage, &affinity("disks", "Lt", &["3"])));
        assert!(!valid_node(&storage, &affinity("missing", "In", &["x"])));
        assert!(valid_node(&storage, &affinity("missing", "NotIn", &["x"])));
    }

    #[test]
    fn taints_need_a_matching_toleration() {
        let mut tainted = node("n1", &[]);
        tainted.spec.as_mut().unwrap().taints = Some(vec![Taint {
            key: "storage".into(),
            value: Some("ceph".into()),
            effect: "NoSchedule".into(),
            ..Default::default()
        }]);
        assert_eq!(
            validate_node(&tainted, &Placement::default()),
            Err(Rejection::UntoleratedTaint("storage".into()))
        );

        let equal = Placement {
            tolerations: Some(vec![Toleration {
                key: Some("storage".into()),
                operator: Some("Equal".into()),
                value: Some("ceph".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(valid_node(&tainted, &equal));

        let wrong_effect = Placement {
            tolerations: Some(vec![Toleration {
                key: Some("storage".into()),
                operator: Some("Exists".into()),
                effect: Some("NoExecute".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(!valid_node(&tainted, &wrong_effect));

        let everything = Placement {
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(valid_node(&tainted, &everything));

        // soft taints are ignored
        tainted.spec.as_mut().unwrap().taints.as_mut().unwrap()[0].effect = "PreferNoSchedule".into();
        assert!(valid_node(&tainted, &Placement::default()));
    }

    #[test]
    fn node_info_prefers_external_ip() {
        let mut n = node("node-a", &[(HOSTNAME_LABEL, "a.local")]);
        n.status.as_mut().unwrap().addresses.as_mut().unwrap().push(NodeAddress {
            type_: "ExternalIP".into(),
            address: "192.168.1.1".into(),
        });
        let info = node_info(&n).unwrap();
        assert_eq!(info.address, "192.168.1.1");
        assert_eq!(info.hostname, "a.local");

        let mut bare = node("node-b", &[]);
        bare.status.as_mut().unwrap().addresses = None;
        assert!(node_info(&bare).is_err());
        assert_eq!(node_info(&node("node-c", &[])).unwrap().hostname, "node-c");
    }
}
