//! Decides which failure domain may drain. Everything here is pure; `super::reconcile` gathers
//! the inputs and applies the plan.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};

use super::state::PdbState;

/// CRUSH bucket types from the narrowest to the widest
pub const CRUSH_LEVELS_ORDERED: [&str; 12] = [
    "osd",
    "host",
    "chassis",
    "rack",
    "row",
    "pdu",
    "pod",
    "room",
    "datacenter",
    "zone",
    "region",
    "root",
];

pub const DEFAULT_FAILURE_DOMAIN: &str = "host";

/// Canaries younger than this are left alone even while unschedulable
pub const CANARY_GRACE: Duration = Duration::minutes(1);

fn crush_rank(level: &str) -> Option<usize> {
    CRUSH_LEVELS_ORDERED.iter().position(|l| *l == level)
}

/// The narrowest failure domain any pool spreads over, lowercased. Unknown and empty entries
/// are skipped; `host` when nothing is left.
pub fn min_failure_domain<'a>(domains: impl IntoIterator<Item = &'a str>) -> String {
    domains
        .into_iter()
        .map(|d| d.trim().to_lowercase())
        .filter_map(|d| crush_rank(&d).map(|rank| (rank, d)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, d)| d)
        .unwrap_or_else(|| DEFAULT_FAILURE_DOMAIN.to_string())
}

/// One OSD deployment
#[derive(Debug, Clone, PartialEq)]
pub struct OsdInfo {
    pub id: i32,
    pub node: Option<String>,
    /// Bucket of the pool failure domain level the OSD sits in
    pub domain: Option<String>,
    pub ready: bool,
}

/// One drain canary deployment
#[derive(Debug, Clone, PartialEq)]
pub struct CanaryInfo {
    pub name: String,
    pub node: String,
    pub domain: Option<String>,
    pub ready: bool,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DrainInput {
    pub osds: Vec<OsdInfo>,
    pub canaries: Vec<CanaryInfo>,
    pub pgs_clean: bool,
    pub state: PdbState,
    pub now: DateTime<Utc>,
    pub pg_health_check_timeout: Duration,
    pub osd_maintenance_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DrainPlan {
    pub state: PdbState,
    /// OSDs that keep a blocking budget
    pub protected_osds: BTreeSet<i32>,
    /// OSDs of the chosen domain whose budgets are removed
    pub released_osds: BTreeSet<i32>,
    pub set_noout: Vec<String>,
    pub unset_noout: Vec<String>,
    pub delete_canaries: Vec<String>,
}

/// Failure domains with an unready OSD or an unschedulable canary
pub fn draining_domains(osds: &[OsdInfo], canaries: &[CanaryInfo]) -> BTreeSet<String> {
    let osd_domains = osds.iter().filter(|o| !o.ready).filter_map(|o| o.domain.clone());
    let canary_domains = canaries
        .iter()
        .filter(|c| !c.ready)
        .filter_map(|c| c.domain.clone());
    osd_domains.chain(canary_domains).collect()
}

pub fn plan_drain(input: DrainInput) -> DrainPlan {
    let DrainInput {
        osds,
        canaries,
        pgs_clean,
        mut state,
        now,
        pg_health_check_timeout,
        osd_maintenance_timeout,
    } = input;
    let draining = draining_domains(&osds, &canaries);

    if pgs_clean {
        state.chosen = draining.iter().next().cloned();
        state.pg_unhealthy_since = None;
    } else if state.chosen.is_some() {
        match state.pg_unhealthy_since {
            None => state.pg_unhealthy_since = Some(now),
            Some(since) if now - since > pg_health_check_timeout => {
                state.chosen = None;
                state.pg_unhealthy_since = None;
            }
            Some(_) => {}
        }
    } else {
        state.pg_unhealthy_since = None;
    }

    let mut plan = DrainPlan::default();
    for osd in &osds {
        if osd.domain.is_some() && osd.domain == state.chosen {
            plan.released_osds.insert(osd.id);
        } else {
            plan.protected_osds.insert(osd.id);
        }
    }

    let mut noout: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
    for (domain, set_at) in &state.noout_set_at {
        if Some(domain) == state.chosen.as_ref() {
            if now - *set_at > osd_maintenance_timeout {
                plan.unset_noout.push(domain.clone());
            }
            noout.insert(domain.clone(), *set_at);
        } else {
            plan.unset_noout.push(domain.clone());
        }
    }
    if let Some(chosen) = &state.chosen {
        if !noout.contains_key(chosen) {
            plan.set_noout.push(chosen.clone());
            noout.insert(chosen.clone(), now);
        }
    }
    state.noout_set_at = noout;

    plan.delete_canaries = canaries
        .iter()
        .filter(|c| !c.ready && c.domain.is_some() && c.domain == state.chosen)
        .filter(|c| c.created.is_some_and(|created| now - created > CANARY_GRACE))
        .map(|c| c.name.clone())
        .collect();

    plan.state = state;
    plan
}
