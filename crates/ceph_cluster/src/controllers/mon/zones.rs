//! Which mon goes when there are too many, and which stretch zone a new mon joins

use std::collections::BTreeMap;
use tracing::info;

use crate::{
    api::v1::cephcluster::StretchClusterSpec,
    placement::{choose_stretch_zone, zone_capacity},
    util::errors::{Error, Result, StdError},
};

/// Where one existing mon runs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MonPlacement {
    pub id: String,
    pub node: Option<String>,
    pub zone: Option<String>,
}

/// Mon of a stretch zone that holds more mons than it may
fn over_capacity_in_zone(mons: &[MonPlacement], stretch: &StretchClusterSpec) -> Option<String> {
    for zone in &stretch.zones {
        let members: Vec<&MonPlacement> = mons
            .iter()
            .filter(|m| m.zone.as_deref() == Some(zone.name.as_str()))
            .collect();
        if members.len() > zone_capacity(zone.arbiter) {
            let victim = members.last()?;
            info!("removing extra mon {} in zone {}", victim.id, zone.name);
            return Some(victim.id.clone());
        }
    }
    None
}

/// Second mon found on a node that already runs one
pub fn mon_sharing_a_node(mons: &[MonPlacement]) -> Option<String> {
    let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
    for mon in mons {
        let Some(node) = mon.node.as_deref() else {
            continue;
        };
        if let Some(first) = seen.insert(node, &mon.id) {
            info!("mons {} and {} share node {}", first, mon.id, node);
            return Some(mon.id.clone());
        }
    }
    None
}

/// Picks the mon to drop when the cluster runs more mons than desired: a mon of an overfull
/// stretch zone, then a mon sharing a node, then the lowest-named mon. `mons` must be sorted by
/// id.
pub fn extra_mon_to_remove(mons: &[MonPlacement], stretch: Option<&StretchClusterSpec>) -> Option<String> {
    if let Some(stretch) = stretch.filter(|s| !s.zones.is_empty()) {
        if let Some(id) = over_capacity_in_zone(mons, stretch) {
            return Some(id);
        }
    }
    if let Some(id) = mon_sharing_a_node(mons) {
        return Some(id);
    }
    let lowest = mons.first().map(|m| m.id.clone());
    if let Some(id) = &lowest {
        info!("removing extra mon {}", id);
    }
    lowest
}

/// Zone for a new mon of a stretch cluster. `existing` maps the other mons to their zones.
pub fn zone_for_new_mon(
    stretch: Option<&StretchClusterSpec>,
    existing: &BTreeMap<String, String>,
) -> Result<Option<String>> {
    let Some(stretch) = stretch.filter(|s| !s.zones.is_empty()) else {
        return Ok(None);
    };
    match choose_stretch_zone(stretch, existing) {
        Some(zone) => Ok(Some(zone)),
        None => Err(Error::StdError(StdError::NoNodesAvailable(
            "every stretch zone already holds its maximum number of mons".to_string(),
        ))),
    }
}

/// The mon running in the arbiter zone
pub fn arbiter_mon(zones: &BTreeMap<String, String>, arbiter_zone: &str) -> Option<String> {
    zones
        .iter()
        .find(|(_, zone)| zone.as_str() == arbiter_zone)
        .map(|(id, _)| id.clone())
}
