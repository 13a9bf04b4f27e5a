//! Typed replies of the `ceph` admin commands the operator reads

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PG states that count as clean
pub const CLEAN_PG_STATES: [&str; 3] = ["active+clean", "active+clean+scrubbing", "active+clean+scrubbing+deep"];

/// Reply of `quorum_status`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MonStatusResponse {
    #[serde(default)]
    pub quorum: Vec<i32>,
    #[serde(default)]
    pub monmap: MonMap,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MonMap {
    #[serde(default)]
    pub fsid: String,
    #[serde(default)]
    pub mons: Vec<MonMapEntry>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MonMapEntry {
    pub name: String,
    pub rank: i32,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub public_addr: String,
}

impl MonMapEntry {
    /// `ip:port` without the trailing nonce (`/0`)
    pub fn endpoint(&self) -> String {
        let addr = if self.public_addr.is_empty() { &self.addr } else { &self.public_addr };
        match addr.split_once('/') {
            Some((endpoint, _)) => endpoint.to_string(),
            None => addr.clone(),
        }
    }
}

impl MonStatusResponse {
    pub fn in_quorum(&self, name: &str) -> bool {
        self.monmap
            .mons
            .iter()
            .any(|m| m.name == name && self.quorum.contains(&m.rank))
    }

    /// Names of every mon in the monmap that is part of the quorum
    pub fn quorum_names(&self) -> Vec<String> {
        self.monmap
            .mons
            .iter()
            .filter(|m| self.quorum.contains(&m.rank))
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn all_in_quorum(&self) -> bool {
        self.monmap.mons.iter().all(|m| self.quorum.contains(&m.rank))
    }
}

/// Reply of `status`
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct CephStatus {
    #[serde(default)]
    pub fsid: String,
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub pgmap: PgMap,
    #[serde(default)]
    pub mgrmap: MgrMap,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct HealthStatus {
    #[serde(default)]
    pub status: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct PgMap {
    #[serde(default)]
    pub pgs_by_state: Vec<PgStateEntry>,
    #[serde(default)]
    pub num_pgs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct PgStateEntry {
    pub state_name: String,
    pub count: u64,
}

impl CephStatus {
    /// Whether every placement group is clean, with a message for logs and conditions
    pub fn pgs_clean(&self) -> (bool, String) {
        if self.pgmap.num_pgs == 0 {
            return (true, "cluster has no PGs".to_string());
        }
        let clean: u64 = self
            .pgmap
            .pgs_by_state
            .iter()
            .filter(|pg| CLEAN_PG_STATES.contains(&pg.state_name.as_str()))
            .map(|pg| pg.count)
            .sum();
        if clean == self.pgmap.num_pgs {
            return (true, "all PGs in cluster are clean".to_string());
        }
        let states: Vec<String> = self
            .pgmap
            .pgs_by_state
            .iter()
            .map(|pg| format!("{}={}", pg.state_name, pg.count))
            .collect();
        (false, format!("cluster is not fully clean. PGs: [{}]", states.join(" ")))
    }
}

/// Reply of `mgr dump`; also embedded in `status`
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct MgrMap {
    #[serde(default)]
    pub active_name: String,
    #[serde(default)]
    pub available: bool,
}

/// Reply of `osd find <id>`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct CrushFindResult {
    #[serde(rename = "osd")]
    pub id: i32,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub crush_location: BTreeMap<String, String>,
}

/// Reply of `versions`, reduced to the mon daemons
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct DaemonVersions {
    #[serde(default)]
    pub mon: BTreeMap<String, u32>,
}

/// A `major.minor.patch` ceph release
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct CephVersion {
    pub major: u32,
    pub minor: u32,
    pub extra: u32,
}

impl CephVersion {
    pub const fn new(major: u32, minor: u32, extra: u32) -> Self {
        Self { major, minor, extra }
    }

    /// Parses "18.2.0" as well as the banner form "ceph version 18.2.0 (hash) reef (stable)"
    pub fn parse(s: &str) -> Option<Self> {
        let word = s
            .split_whitespace()
            .find(|w| w.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
        let mut parts = word.split(['.', '-']).map(|p| p.parse::<u32>());
        let major = parts.next()?.ok()?;
        let minor = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        let extra = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        Some(Self { major, minor, extra })
    }

    pub fn is_at_least(&self, other: &CephVersion) -> bool {
        self >= other
    }
}

impl std::fmt::Display for CephVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEALTHY_STATUS: &str = r#"{"fsid":"877a47e0-7f6c-435e-891a-76983ab8c509","health":{"checks":{},"status":"HEALTH_OK"},"election_epoch":12,"quorum":[0,1,2],"quorum_names":["a","b","c"],"monmap":{"epoch":3,"fsid":"877a47e0-7f6c-435e-891a-76983ab8c509","mons":[{"rank":0,"name":"a","addr":"172.30.74.42:6789/0"}]},"osdmap":{"osdmap":{"epoch":15,"num_osds":3,"num_up_osds":3,"num_in_osds":3}},"pgmap":{"pgs_by_state":[{"state_name":"active+clean","count":100}],"num_pgs":100},"mgrmap":{"epoch":6,"active_gid":5250,"active_name":"a","available":true}}"#;

    const UNHEALTHY_STATUS: &str = r#"{"fsid":"877a47e0-7f6c-435e-891a-76983ab8c509","health":{"status":"HEALTH_WARN"},"pgmap":{"pgs_by_state":[{"state_name":"active+clean","count":88},{"state_name":"active+undersized+degraded","count":12}],"num_pgs":100},"mgrmap":{"active_name":"a","available":true}}"#;

    #[test]
    fn healthy_status_is_clean() {
        let status: CephStatus = serde_json::from_str(HEALTHY_STATUS).unwrap();
        assert_eq!(status.health.status, "HEALTH_OK");
        assert_eq!(status.mgrmap.active_name, "a");
        assert!(status.pgs_clean().0);
    }

    #[test]
    fn degraded_pgs_are_not_clean() {
        let status: CephStatus = serde_json::from_str(UNHEALTHY_STATUS).unwrap();
        let (clean, msg) = status.pgs_clean();
        assert!(!clean);
        assert!(msg.contains("active+undersized+degraded=12"));
    }

    #[test]
    fn scrubbing_counts_as_clean_and_empty_maps_are_clean() {
        let status = CephStatus {
            pgmap: PgMap {
                pgs_by_state: vec![
                    PgStateEntry { state_name: "active+clean".into(), count: 10 },
                    PgStateEntry { state_name: "active+clean+scrubbing".into(), count: 3 },
                    PgStateEntry { state_name: "active+clean+scrubbing+deep".into(), count: 2 },
                ],
                num_pgs: 15,
            },
            ..Default::default()
        };
        assert!(status.pgs_clean().0);
        assert!(CephStatus::default().pgs_clean().0);
    }

    #[test]
    fn quorum_membership() {
        let status: MonStatusResponse = serde_json::from_value(serde_json::json!({
            "quorum": [0, 2],
            "monmap": {
                "fsid": "abc",
                "mons": [
                    {"name": "a", "rank": 0, "public_addr": "10.0.0.1:6789/0"},
                    {"name": "b", "rank": 1, "public_addr": "10.0.0.2:6789/0"},
                    {"name": "c", "rank": 2, "public_addr": "10.0.0.3:6789/0"}
                ]
            }
        }))
        .unwrap();
        assert!(status.in_quorum("a"));
        assert!(!status.in_quorum("b"));
        assert!(!status.all_in_quorum());
        assert_eq!(status.quorum_names(), vec!["a", "c"]);
        assert_eq!(status.monmap.mons[1].endpoint(), "10.0.0.2:6789");
    }

    #[test]
    fn versions_parse_and_compare() {
        let banner = CephVersion::parse("ceph version 16.2.7 (dd0603118f56ab514f133c8d2e3adfc983942503) pacific (stable)");
        assert_eq!(banner, Some(CephVersion::new(16, 2, 7)));
        assert!(CephVersion::parse("18.2.0").unwrap().is_at_least(&CephVersion::new(16, 2, 7)));
        assert!(!CephVersion::parse("16.2.6").unwrap().is_at_least(&CephVersion::new(16, 2, 7)));
        assert_eq!(CephVersion::parse("v"), None);
    }
}
