//! Cluster identity and the monitor map that says which mons should exist.
//!
//! The identity lives in the `rook-ceph-mon` secret, the monitor map in the
//! `rook-ceph-mon-endpoints` configmap. Both are loaded at the start of every mon reconcile and
//! written back in one update after a structural change.

mod store;

pub use store::ClusterInfoStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::Path};
use tracing::warn;

use crate::{
    ceph::status::CephVersion,
    util::errors::{Error, Result, StdError},
};

pub const MON_SECRET_NAME: &str = "rook-ceph-mon";
pub const FSID_KEY: &str = "fsid";
pub const MON_SECRET_KEY: &str = "mon-secret";
pub const ADMIN_SECRET_KEY: &str = "admin-secret";
pub const CLUSTER_NAME_KEY: &str = "cluster-name";

pub const ENDPOINTS_CONFIGMAP: &str = "rook-ceph-mon-endpoints";
pub const ENDPOINT_DATA_KEY: &str = "data";
pub const MAX_MON_ID_KEY: &str = "maxMonId";
pub const MAPPING_KEY: &str = "mapping";
pub const OUT_OF_QUORUM_KEY: &str = "outOfQuorum";

pub const MON_APP: &str = "rook-ceph-mon";

/// Legacy msgr1 port, used when an endpoint carries none
pub const DEFAULT_MON_PORT: i32 = 6789;

const LETTERS: u32 = 26;

#[derive(Clone, PartialEq, Default)]
pub struct ClusterInfo {
    pub namespace: String,
    pub name: String,
    pub fsid: String,
    pub mon_secret: String,
    pub admin_secret: String,
    /// Mons that should exist, keyed by daemon id
    pub monitors: BTreeMap<String, MonInfo>,
    /// Highest daemon id index ever handed out; -1 before the first mon
    pub max_mon_id: i32,
    pub mapping: Mapping,
    pub ceph_version: Option<CephVersion>,
    /// First time each mon was seen outside the quorum
    pub out_of_quorum: BTreeMap<String, DateTime<Utc>>,
}

// secrets stay out of logs
impl fmt::Debug for ClusterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterInfo")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("fsid", &self.fsid)
            .field("monitors", &self.monitors)
            .field("max_mon_id", &self.max_mon_id)
            .field("mapping", &self.mapping)
            .field("ceph_version", &self.ceph_version)
            .field("out_of_quorum", &self.out_of_quorum)
            .finish_non_exhaustive()
    }
}

impl ClusterInfo {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            name: namespace.clone(),
            namespace,
            max_mon_id: -1,
            ..Default::default()
        }
    }

    /// `name=endpoint,...` of every known mon
    pub fn endpoints(&self) -> String {
        flatten_mon_endpoints(&self.monitors)
    }

    /// Comma separated `ip:port` list for `mon_host`
    pub fn mon_host(&self) -> String {
        self.monitors
            .values()
            .map(|m| m.endpoint.clone())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Id of the next mon to create
    pub fn next_mon_id(&self) -> String {
        index_to_name(self.max_mon_id + 1)
    }

    /// Drops a mon from the monitor map and the node mapping. Returns whether it was known.
    pub fn remove_mon(&mut self, id: &str) -> bool {
        self.out_of_quorum.remove(id);
        let known = self.monitors.remove(id).is_some();
        if let Some(node) = self.mapping.node.remove(id) {
            // free the node's port slot once no other mon is pinned there
            if !self.mapping.node.values().any(|n| n.name == node.name) {
                self.mapping.port.remove(&node.name);
            }
        }
        known
    }

    /// Raises `max_mon_id` to cover every mon in the map
    fn reconcile_max_mon_id(&mut self) {
        let stored = self.max_mon_id;
        for id in self.monitors.keys() {
            match name_to_index(id) {
                Ok(index) if index > self.max_mon_id => self.max_mon_id = index,
                Ok(_) => {}
                Err(_) => warn!("ignoring mon with unexpected id '{}'", id),
            }
        }
        if stored != self.max_mon_id {
            warn!("updating obsolete maxMonId {} to actual value {}", stored, self.max_mon_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MonInfo {
    pub name: String,
    /// `ip:port`
    pub endpoint: String,
}

impl MonInfo {
    pub fn new(name: impl Into<String>, ip: &str, port: i32) -> Self {
        Self {
            name: name.into(),
            endpoint: format!("{ip}:{port}"),
        }
    }

    pub fn ip(&self) -> &str {
        match self.endpoint.rsplit_once(':') {
            Some((ip, _)) => ip,
            None => &self.endpoint,
        }
    }

    pub fn port(&self) -> i32 {
        self.endpoint
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(DEFAULT_MON_PORT)
    }
}

/// Resource coordinates of one mon while it is being created or failed over
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MonConfig {
    /// Name of the deployment, service and PVC
    pub resource_name: String,
    pub daemon_id: String,
    /// Node address or service cluster IP
    pub public_ip: String,
    pub port: i32,
    /// Stretch zone the mon belongs to
    pub zone: Option<String>,
    pub pvc_name: Option<String>,
}

impl MonConfig {
    pub fn new(daemon_id: &str, port: i32) -> Self {
        Self {
            resource_name: format!("{MON_APP}-{daemon_id}"),
            daemon_id: daemon_id.to_string(),
            port,
            ..Default::default()
        }
    }
}

/// Node placement of every mon and, under host networking, the next free port per node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(default)]
    pub node: BTreeMap<String, NodeInfo>,
    #[serde(default)]
    pub port: BTreeMap<String, i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeInfo {
    pub name: String,
    pub hostname: String,
    pub address: String,
}

/// Renders the monitor map as `a=10.0.0.1:6789,b=10.0.0.2:6789`
pub fn flatten_mon_endpoints(monitors: &BTreeMap<String, MonInfo>) -> String {
    monitors
        .values()
        .map(|m| format!("{}={}", m.name, m.endpoint))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses the `data` key of the endpoints configmap. Malformed entries are skipped.
pub fn parse_mon_endpoints(data: &str) -> BTreeMap<String, MonInfo> {
    data.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .filter_map(|entry| match entry.split_once('=') {
            Some((name, endpoint)) if !name.is_empty() && !endpoint.is_empty() => Some((
                name.to_string(),
                MonInfo {
                    name: name.to_string(),
                    endpoint: endpoint.to_string(),
                },
            )),
            _ => {
                warn!("skipping malformed mon endpoint '{}'", entry);
                None
            }
        })
        .collect()
}

/// Daemon id of the `index`-th mon: 0 is `a`, 25 is `z`, 26 is `aa`
pub fn index_to_name(index: i32) -> String {
    let mut n = index.max(0) as u32;
    let mut letters = Vec::new();
    loop {
        letters.push(char::from(b'a' + (n % LETTERS) as u8));
        n /= LETTERS;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    letters.iter().rev().collect()
}

/// Inverse of `index_to_name`
pub fn name_to_index(name: &str) -> Result<i32> {
    if name.is_empty() {
        return Err(Error::StdError(StdError::InvalidArgument(
            "empty daemon id".to_string(),
        )));
    }
    let mut index: i64 = 0;
    for c in name.chars() {
        if !c.is_ascii_lowercase() {
            return Err(Error::StdError(StdError::InvalidArgument(format!(
                "daemon id '{name}' is not made of lowercase letters"
            ))));
        }
        index = index * i64::from(LETTERS) + i64::from(c as u8 - b'a') + 1;
        if index > i64::from(i32::MAX) {
            return Err(Error::StdError(StdError::InvalidArgument(format!(
                "daemon id '{name}' is too long"
            ))));
        }
    }
    Ok((index - 1) as i32)
}

/// Decodes the endpoints configmap data into `info`
pub(crate) fn hydrate_endpoints(info: &mut ClusterInfo, data: &BTreeMap<String, String>) {
    if let Some(endpoints) = data.get(ENDPOINT_DATA_KEY) {
        info.monitors = parse_mon_endpoints(endpoints);
    }
    if let Some(id) = data.get(MAX_MON_ID_KEY) {
        match id.trim().parse::<i32>() {
            Ok(id) => info.max_mon_id = id,
            Err(e) => warn!("invalid max mon id '{}': {}", id, e),
        }
    }
    info.reconcile_max_mon_id();

    if let Some(mapping) = data.get(MAPPING_KEY).filter(|m| !m.is_empty()) {
        match serde_json::from_str(mapping) {
            Ok(mapping) => info.mapping = mapping,
            Err(e) => warn!("invalid JSON in mon mapping: {}", e),
        }
    }
    if let Some(out) = data.get(OUT_OF_QUORUM_KEY).filter(|m| !m.is_empty()) {
        match serde_json::from_str(out) {
            Ok(out) => info.out_of_quorum = out,
            Err(e) => warn!("invalid JSON in out of quorum table: {}", e),
        }
    }
}

/// Encodes the monitor map for the endpoints configmap
pub(crate) fn endpoints_data(info: &ClusterInfo) -> Result<BTreeMap<String, String>> {
    Ok(BTreeMap::from([
        (ENDPOINT_DATA_KEY.to_string(), info.endpoints()),
        (MAX_MON_ID_KEY.to_string(), info.max_mon_id.to_string()),
        (MAPPING_KEY.to_string(), serde_json::to_string(&info.mapping)?),
        (OUT_OF_QUORUM_KEY.to_string(), serde_json::to_string(&info.out_of_quorum)?),
    ]))
}

/// Minimal ceph.conf the admin tools connect with
pub fn connection_config(info: &ClusterInfo, keyring: &Path) -> String {
    format!(
        "[global]\nfsid = {}\nmon initial members = {}\nmon host = {}\n\n[client.admin]\nkeyring = {}\n",
        info.fsid,
        info.monitors.keys().cloned().collect::<Vec<_>>().join(" "),
        info.mon_host(),
        keyring.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitors(pairs: &[(&str, &str)]) -> BTreeMap<String, MonInfo> {
        pairs
            .iter()
            .map(|(n, e)| {
                (
                    n.to_string(),
                    MonInfo {
                        name: n.to_string(),
                        endpoint: e.to_string(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn endpoints_survive_a_round_trip() {
        let mons = monitors(&[("a", "10.0.0.1:6789"), ("b", "10.0.0.2:6789"), ("c", "[::1]:3300")]);
        let flat = flatten_mon_endpoints(&mons);
        assert_eq!(flat, "a=10.0.0.1:6789,b=10.0.0.2:6789,c=[::1]:3300");
        assert_eq!(flatten_mon_endpoints(&parse_mon_endpoints(&flat)), flat);
        assert_eq!(parse_mon_endpoints(&flat), mons);
    }

    #[test]
    fn malformed_endpoints_are_skipped() {
        let parsed = parse_mon_endpoints("a=1.2.3.4:6789,,garbage,=x,b=");
        assert_eq!(parsed.len(), 1);
        assert!(parse_mon_endpoints("").is_empty());
    }

    #[test]
    fn daemon_ids_are_base26() {
        assert_eq!(index_to_name(0), "a");
        assert_eq!(index_to_name(25), "z");
        assert_eq!(index_to_name(26), "aa");
        assert_eq!(index_to_name(27), "ab");
        assert_eq!(index_to_name(26 + 26 * 26), "aaa");
        assert_eq!(name_to_index("zz").unwrap(), 26 + 26 * 26 - 1);
        for i in 0..(26 + 26 * 26 + 26 * 26 * 26 + 100) {
            assert_eq!(name_to_index(&index_to_name(i)).unwrap(), i);
        }
        assert!(name_to_index("A").is_err());
        assert!(name_to_index("").is_err());
        assert!(name_to_index("mon-a").is_err());
    }

    #[test]
    fn mon_info_endpoint_parts() {
        let mon = MonInfo::new("a", "10.0.0.1", 3300);
        assert_eq!(mon.ip(), "10.0.0.1");
        assert_eq!(mon.port(), 3300);
        let bare = MonInfo {
            name: "b".into(),
            endpoint: "10.0.0.2".into(),
        };
        assert_eq!(bare.ip(), "10.0.0.2");
        assert_eq!(bare.port(), DEFAULT_MON_PORT);
    }

    #[test]
    fn max_mon_id_never_trails_the_mons() {
        let mut info = ClusterInfo::new("rook-ceph");
        let data = BTreeMap::from([
            ("data".to_string(), "a=1.1.1.1:6789,d=1.1.1.4:6789".to_string()),
            ("maxMonId".to_string(), "1".to_string()),
        ]);
        hydrate_endpoints(&mut info, &data);
        assert_eq!(info.max_mon_id, 3);
        assert_eq!(info.next_mon_id(), "e");

        let mut fresh = ClusterInfo::new("rook-ceph");
        hydrate_endpoints(&mut fresh, &BTreeMap::new());
        assert_eq!(fresh.max_mon_id, -1);
        assert_eq!(fresh.next_mon_id(), "a");
    }

    #[test]
    fn mapping_uses_capitalized_node_fields() {
        let mut info = ClusterInfo::new("rook-ceph");
        info.monitors = monitors(&[("a", "10.0.0.1:6789")]);
        info.max_mon_id = 0;
        info.mapping.node.insert(
            "a".into(),
            NodeInfo {
                name: "node1".into(),
                hostname: "node1.local".into(),
                address: "10.0.0.1".into(),
            },
        );
        info.mapping.port.insert("node1".into(), 6790);
        let data = endpoints_data(&info).unwrap();
        let mapping: serde_json::Value = serde_json::from_str(&data["mapping"]).unwrap();
        assert_json_diff::assert_json_eq!(
            mapping,
            serde_json::json!({
                "node": {"a": {"Name": "node1", "Hostname": "node1.local", "Address": "10.0.0.1"}},
                "port": {"node1": 6790}
            })
        );
        assert_eq!(data["maxMonId"], "0");

        let mut loaded = ClusterInfo::new("rook-ceph");
        hydrate_endpoints(&mut loaded, &data);
        assert_eq!(loaded.mapping, info.mapping);
        assert_eq!(loaded.monitors, info.monitors);
    }

    #[test]
    fn removing_a_mon_frees_its_node() {
        let mut info = ClusterInfo::new("rook-ceph");
        info.monitors = monitors(&[("a", "10.0.0.1:6789"), ("b", "10.0.0.1:6790")]);
        for id in ["a", "b"] {
            info.mapping.node.insert(
                id.into(),
                NodeInfo {
                    name: "node1".into(),
                    ..Default::default()
                },
            );
        }
        info.mapping.port.insert("node1".into(), 6791);
        info.out_of_quorum.insert("a".into(), Utc::now());

        assert!(info.remove_mon("a"));
        assert!(info.out_of_quorum.is_empty());
        assert_eq!(info.mapping.port.get("node1"), Some(&6791));
        assert!(info.remove_mon("b"));
        assert!(info.mapping.port.is_empty());
        assert!(!info.remove_mon("b"));
    }

    #[test]
    fn connection_config_lists_every_mon() {
        let mut info = ClusterInfo::new("rook-ceph");
        info.fsid = "f00".into();
        info.monitors = monitors(&[("a", "10.0.0.1:6789"), ("b", "10.0.0.2:6789")]);
        let conf = connection_config(&info, Path::new("/var/lib/rook/rook-ceph/client.admin.keyring"));
        assert!(conf.contains("fsid = f00\n"));
        assert!(conf.contains("mon initial members = a b\n"));
        assert!(conf.contains("mon host = 10.0.0.1:6789,10.0.0.2:6789\n"));
        assert!(conf.contains("keyring = /var/lib/rook/rook-ceph/client.admin.keyring"));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let mut info = ClusterInfo::new("rook-ceph");
        info.admin_secret = "AQBadmin==".into();
        info.mon_secret = "AQBmon==".into();
        let printed = format!("{info:?}");
        assert!(!printed.contains("AQB"));
    }
}
