//! Node selection for mons: which nodes may host one, which node each new mon lands on and, in
//! stretch clusters, which zone it belongs to.

mod node;

pub use node::*;

use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::{
    api::v1::cephcluster::{Placement, StretchClusterSpec},
    cluster_info::{Mapping, MonConfig},
    util::errors::{Error, Result, StdError},
};

pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Label set on mon pods started only to probe schedulability
pub const MON_CANARY_LABEL: &str = "mon_canary";

/// Node label naming the stretch zone of a node
pub fn failure_domain_label(stretch: &StretchClusterSpec) -> &str {
    if stretch.failure_domain_label.is_empty() {
        ZONE_LABEL
    } else {
        &stretch.failure_domain_label
    }
}

/// Names of the nodes that already run a mon. Canary pods do not count.
pub fn nodes_with_mons(nodes: &[Node], mon_pods: &[Pod]) -> BTreeSet<String> {
    let mut used = BTreeSet::new();
    for pod in mon_pods {
        let labels = pod.metadata.labels.as_ref();
        if labels.is_some_and(|l| l.contains_key(MON_CANARY_LABEL)) {
            continue;
        }
        let Some(spec) = pod.spec.as_ref() else {
            continue;
        };
        if let Some(name) = spec.node_name.as_ref().filter(|n| !n.is_empty()) {
            used.insert(name.clone());
            continue;
        }
        // a pending pod is pinned through its hostname selector
        let Some(hostname) = spec.node_selector.as_ref().and_then(|s| s.get(HOSTNAME_LABEL)) else {
            continue;
        };
        if let Some(node) = nodes
            .iter()
            .find(|n| node_label(n, HOSTNAME_LABEL).unwrap_or(node_name(n)) == hostname)
        {
            used.insert(node_name(node).to_string());
        }
    }
    used
}

/// Valid nodes without a mon, sorted by name. When every valid node already hosts a mon and
/// several mons may share a node, all valid nodes are returned.
pub fn available_nodes(nodes: &[Node], mon_pods: &[Pod], placement: &Placement, allow_multiple: bool) -> Vec<Node> {
    let used = nodes_with_mons(nodes, mon_pods);
    let mut valid: Vec<Node> = nodes.iter().filter(|n| valid_node(n, placement)).cloned().collect();
    valid.sort_by(|a, b| node_name(a).cmp(node_name(b)));

    let free: Vec<Node> = valid
        .iter()
        .filter(|n| !used.contains(node_name(n)))
        .cloned()
        .collect();
    if free.is_empty() && allow_multiple {
        debug!("all {} valid nodes host a mon, allowing more than one per node", valid.len());
        return valid;
    }
    free
}

#[derive(Debug, Clone, Copy)]
pub struct AssignOptions<'a> {
    pub host_network: bool,
    pub allow_multiple: bool,
    /// Node label compared against `MonConfig::zone`
    pub zone_label: &'a str,
}

/// Pins every mon without a mapping entry to a node, round-robin over `available`.
///
/// Under host networking each mon on the same node gets the next port, so a second mon on a
/// node listens on 6790. Mons already in the mapping keep their node.
pub fn assign_mons(
    mons: &mut [MonConfig],
    available: &[Node],
    mapping: &mut Mapping,
    opts: AssignOptions<'_>,
) -> Result<()> {
    let mut taken: BTreeSet<String> = BTreeSet::new();
    let mut next = 0usize;

    for mon in mons.iter_mut() {
        if let Some(existing) = mapping.node.get(&mon.daemon_id) {
            if opts.host_network {
                if let Some(port) = mapping.port.get(&existing.name) {
                    mon.port = *port;
                }
            }
            continue;
        }

        let candidates: Vec<&Node> = available
            .iter()
            .filter(|n| match &mon.zone {
                Some(zone) => node_label(n, opts.zone_label) == Some(zone.as_str()),
                None => true,
            })
            .filter(|n| opts.allow_multiple || !taken.contains(node_name(n)))
            .collect();
        if candidates.is_empty() {
            let scope = mon
                .zone
                .as_ref()
                .map(|z| format!(" in zone {z}"))
                .unwrap_or_default();
            return Err(Error::StdError(StdError::NoNodesAvailable(format!(
                "no node available{scope} for mon {}",
                mon.daemon_id
            ))));
        }

        let node = candidates[next % candidates.len()];
        next += 1;
        let info = node_info(node)?;

        if opts.host_network {
            let port = match mapping.port.get(&info.name) {
                Some(last) => last + 1,
                None => mon.port,
            };
            mapping.port.insert(info.name.clone(), port);
            mon.port = port;
        }
        info!("mon {} assigned to node {}", mon.daemon_id, info.name);
        taken.insert(info.name.clone());
        mapping.node.insert(mon.daemon_id.clone(), info);
    }
    Ok(())
}

/// Zone of every mapped mon, read from the failure-domain label of its node
pub fn mon_zones(mapping: &Mapping, nodes: &[Node], zone_label: &str) -> BTreeMap<String, String> {
    mapping
        .node
        .iter()
        .filter_map(|(id, info)| {
            let node = nodes.iter().find(|n| node_name(n) == info.name)?;
            Some((id.clone(), node_label(node, zone_label)?.to_string()))
        })
        .collect()
}

/// Most mons a stretch zone may hold
pub fn zone_capacity(arbiter: bool) -> usize {
    if arbiter {
        1
    } else {
        2
    }
}

/// Zone for a new mon: the zone with the fewest mons that still has room, earlier zones in the
/// spec win ties. `None` when every zone is full.
pub fn choose_stretch_zone(stretch: &StretchClusterSpec, existing: &BTreeMap<String, String>) -> Option<String> {
    stretch
        .zones
        .iter()
        .map(|zone| {
            let count = existing.values().filter(|z| **z == zone.name).count();
            (zone, count)
        })
        .filter(|(zone, count)| *count < zone_capacity(zone.arbiter))
        .min_by_key(|(_, count)| *count)
        .map(|(zone, _)| zone.name.clone())
}

#[cfg(test)]
mod tests {
    use super::node::tests::node;
    use super::*;
    use crate::{api::v1::cephcluster::StretchZone, cluster_info::NodeInfo};
    use k8s_openapi::api::core::v1::PodSpec;
    use kube::api::ObjectMeta;

    fn mon_pod(node: Option<&str>, selector: Option<&str>, canary: bool) -> Pod {
        let mut labels = vec![("app", "rook-ceph-mon")];
        if canary {
            labels.push((MON_CANARY_LABEL, "true"));
        }
        Pod {
            metadata: ObjectMeta {
                labels: Some(crate::util::k8s::labels(&labels)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                node_selector: selector.map(|h| crate::util::k8s::labels(&[(HOSTNAME_LABEL, h)])),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn opts(host_network: bool, allow_multiple: bool) -> AssignOptions<'static> {
        AssignOptions {
            host_network,
            allow_multiple,
            zone_label: ZONE_LABEL,
        }
    }

    fn stretch(zones: &[(&str, bool)]) -> StretchClusterSpec {
        StretchClusterSpec {
            failure_domain_label: String::new(),
            zones: zones
                .iter()
                .map(|(name, arbiter)| StretchZone {
                    name: name.to_string(),
                    arbiter: *arbiter,
                })
                .collect(),
        }
    }

    #[test]
    fn three_mons_land_on_three_nodes() {
        let nodes = vec![node("n3", &[]), node("n1", &[]), node("n2", &[])];
        let available = available_nodes(&nodes, &[], &Placement::default(), false);
        let names: Vec<_> = available.iter().map(node_name).collect();
        assert_eq!(names, vec!["n1", "n2", "n3"]);

        let mut mons: Vec<MonConfig> = ["a", "b", "c"].iter().map(|id| MonConfig::new(id, 6789)).collect();
        let mut mapping = Mapping::default();
        assign_mons(&mut mons, &available, &mut mapping, opts(false, false)).unwrap();
        assert_eq!(mapping.node["a"].name, "n1");
        assert_eq!(mapping.node["b"].name, "n2");
        assert_eq!(mapping.node["c"].name, "n3");
        assert!(mapping.port.is_empty());
    }

    #[test]
    fn nodes_running_mons_are_skipped_but_canaries_are_not() {
        let nodes = vec![node("n1", &[]), node("n2", &[(HOSTNAME_LABEL, "host-2")]), node("n3", &[])];
        let pods = vec![
            mon_pod(Some("n1"), None, false),
            mon_pod(None, Some("host-2"), false),
            mon_pod(Some("n3"), None, true),
        ];
        let available = available_nodes(&nodes, &pods, &Placement::default(), false);
        assert_eq!(available.iter().map(node_name).collect::<Vec<_>>(), vec!["n3"]);
    }

    #[test]
    fn full_nodes_are_reused_only_when_allowed() {
        let nodes = vec![node("n1", &[])];
        let pods = vec![mon_pod(Some("n1"), None, false)];
        assert!(available_nodes(&nodes, &pods, &Placement::default(), false).is_empty());
        assert_eq!(available_nodes(&nodes, &pods, &Placement::default(), true).len(), 1);
    }

    #[test]
    fn host_network_ports_increment_per_node() {
        let nodes = vec![node("n1", &[]), node("n2", &[])];
        let mut mons: Vec<MonConfig> = ["a", "b", "c"].iter().map(|id| MonConfig::new(id, 6789)).collect();
        let mut mapping = Mapping::default();
        assign_mons(&mut mons, &nodes, &mut mapping, opts(true, true)).unwrap();

        assert_eq!(mapping.node["a"].name, "n1");
        assert_eq!(mapping.node["b"].name, "n2");
        assert_eq!(mapping.node["c"].name, "n1");
        assert_eq!(mons[0].port, 6789);
        assert_eq!(mons[1].port, 6789);
        assert_eq!(mons[2].port, 6790);
        assert_eq!(mapping.port["n1"], 6790);
    }

    #[test]
    fn mapped_mons_keep_their_node() {
        let nodes = vec![node("n1", &[]), node("n2", &[])];
        let mut mapping = Mapping::default();
        mapping.node.insert(
            "a".into(),
            NodeInfo {
                name: "n2".into(),
                hostname: "n2".into(),
                address: "10.0.0.2".into(),
            },
        );
        let mut mons = vec![MonConfig::new("a", 6789), MonConfig::new("b", 6789)];
        assign_mons(&mut mons, &nodes, &mut mapping, opts(false, false)).unwrap();
        assert_eq!(mapping.node["a"].name, "n2");
        assert_eq!(mapping.node["b"].name, "n1");
    }

    #[test]
    fn no_nodes_is_reported_only_when_a_mon_needs_one() {
        let mut mapping = Mapping::default();
        let mut mons = vec![MonConfig::new("a", 6789)];
        let err = assign_mons(&mut mons, &[], &mut mapping, opts(false, false)).unwrap_err();
        assert_eq!(err.reason(), "NoNodesAvailable");

        let mut none: Vec<MonConfig> = Vec::new();
        assign_mons(&mut none, &[], &mut mapping, opts(false, false)).unwrap();

        // one node cannot host two mons unless allowed
        let nodes = vec![node("n1", &[])];
        let mut two = vec![MonConfig::new("a", 6789), MonConfig::new("b", 6789)];
        assert!(assign_mons(&mut two, &nodes, &mut Mapping::default(), opts(false, false)).is_err());
    }

    #[test]
    fn stretch_mons_are_placed_in_their_zone() {
        let nodes = vec![
            node("n-a", &[(ZONE_LABEL, "a")]),
            node("n-b", &[(ZONE_LABEL, "b")]),
            node("n-arb", &[(ZONE_LABEL, "arbiter")]),
        ];
        let mut mon = MonConfig::new("d", 6789);
        mon.zone = Some("arbiter".into());
        let mut mapping = Mapping::default();
        assign_mons(std::slice::from_mut(&mut mon), &nodes, &mut mapping, opts(false, false)).unwrap();
        assert_eq!(mapping.node["d"].name, "n-arb");

        let zones = mon_zones(&mapping, &nodes, ZONE_LABEL);
        assert_eq!(zones["d"], "arbiter");
    }

    #[test]
    fn stretch_zone_choice_respects_capacity() {
        let spec = stretch(&[("a", false), ("b", false), ("arbiter", true)]);
        let mut existing = BTreeMap::new();
        assert_eq!(choose_stretch_zone(&spec, &existing).as_deref(), Some("a"));

        existing.insert("a".to_string(), "a".to_string());
        existing.insert("b".to_string(), "b".to_string());
        existing.insert("c".to_string(), "arbiter".to_string());
        existing.insert("d".to_string(), "a".to_string());
        assert_eq!(choose_stretch_zone(&spec, &existing).as_deref(), Some("b"));

        existing.insert("e".to_string(), "b".to_string());
        assert_eq!(choose_stretch_zone(&spec, &existing), None);
    }
}
