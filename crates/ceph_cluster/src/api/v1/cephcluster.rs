use k8s_openapi::{
    api::core::v1::{NodeAffinity, Toleration},
    apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::{conditions_schema, preserve_unknown_list, preserve_unknown_object};

/// Generate the Kubernetes wrapper struct `CephCluster` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CephCluster", group = "ceph.rook.io", version = "v1", namespaced)]
#[kube(status = "CephClusterStatus", shortname = "ceph")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[serde(rename_all = "camelCase")]
pub struct CephClusterSpec {
    #[serde(default)]
    pub ceph_version: CephVersionSpec,
    #[serde(default = "default_data_dir_host_path")]
    pub data_dir_host_path: String,
    #[serde(default)]
    pub mon: MonSpec,
    #[serde(default)]
    pub mgr: MgrSpec,
    #[serde(default)]
    pub dashboard: DashboardSpec,
    #[serde(default)]
    pub network: NetworkSpec,
    #[serde(default)]
    pub placement: PlacementSpec,
    #[serde(default)]
    pub disruption_management: DisruptionManagementSpec,
    #[serde(default)]
    pub log_collector: LogCollectorSpec,
    #[serde(default)]
    pub health_check: HealthCheckSpec,
    #[serde(default)]
    pub external: ExternalSpec,
}

fn default_data_dir_host_path() -> String {
    "/var/lib/rook".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CephVersionSpec {
    #[serde(default = "default_ceph_image")]
    pub image: String,
    /// Release of the image, e.g. "18.2.0"; queried from the mons when unset
    pub version: Option<String>,
}

fn default_ceph_image() -> String {
    "quay.io/ceph/ceph:v18.2.0".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonSpec {
    #[serde(default = "default_mon_count")]
    pub count: i32,
    #[serde(default)]
    pub allow_multiple_per_node: bool,
    pub stretch_cluster: Option<StretchClusterSpec>,
    /// Back mon data with PVCs instead of host paths
    pub volume_claim_template: Option<MonVolumeClaimTemplate>,
}

impl Default for MonSpec {
    fn default() -> Self {
        Self {
            count: default_mon_count(),
            allow_multiple_per_node: false,
            stretch_cluster: None,
            volume_claim_template: None,
        }
    }
}

fn default_mon_count() -> i32 {
    3
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StretchClusterSpec {
    /// Node label naming the zone, `topology.kubernetes.io/zone` when empty
    #[serde(default)]
    pub failure_domain_label: String,
    #[serde(default)]
    pub zones: Vec<StretchZone>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StretchZone {
    pub name: String,
    #[serde(default)]
    pub arbiter: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonVolumeClaimTemplate {
    pub storage_class_name: Option<String>,
    #[serde(default = "default_mon_volume_size")]
    pub size: String,
}

fn default_mon_volume_size() -> String {
    "10Gi".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MgrSpec {
    #[serde(default = "default_mgr_count")]
    pub count: i32,
    #[serde(default)]
    pub modules: Vec<MgrModuleSpec>,
}

impl Default for MgrSpec {
    fn default() -> Self {
        Self {
            count: default_mgr_count(),
            modules: Vec::new(),
        }
    }
}

fn default_mgr_count() -> i32 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MgrModuleSpec {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ssl: bool,
    /// Overrides the default 8443 (ssl) or 7000
    pub port: Option<i32>,
    pub url_prefix: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default)]
    pub host_network: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    pub all: Option<Placement>,
    pub mon: Option<Placement>,
    pub mgr: Option<Placement>,
}

impl PlacementSpec {
    /// Daemon specific placement merged over `all`
    pub fn for_daemon(&self, daemon: Option<&Placement>) -> Placement {
        let all = self.all.clone().unwrap_or_default();
        match daemon {
            None => all,
            Some(p) => Placement {
                node_affinity: p.node_affinity.clone().or(all.node_affinity),
                tolerations: match (&p.tolerations, all.tolerations) {
                    (Some(own), Some(mut shared)) => {
                        shared.extend(own.iter().cloned());
                        Some(shared)
                    }
                    (Some(own), None) => Some(own.clone()),
                    (None, shared) => shared,
                },
            },
        }
    }

    pub fn mon_placement(&self) -> Placement {
        self.for_daemon(self.mon.as_ref())
    }

    pub fn mgr_placement(&self) -> Placement {
        self.for_daemon(self.mgr.as_ref())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    #[schemars(schema_with = "preserve_unknown_object")]
    pub node_affinity: Option<NodeAffinity>,
    #[schemars(schema_with = "preserve_unknown_list")]
    pub tolerations: Option<Vec<Toleration>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionManagementSpec {
    #[serde(default)]
    pub manage_pod_budgets: bool,
    /// Minutes a failure domain may hold `noout`; 0 uses the operator default
    #[serde(default)]
    pub osd_maintenance_timeout: u64,
    /// Minutes PGs may stay unclean before the drain window is reset; 0 uses the operator default
    #[serde(default)]
    pub pg_health_check_timeout: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogCollectorSpec {
    #[serde(default)]
    pub enabled: bool,
    /// `daily`, `weekly` or a size such as `500M`
    pub periodicity: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default)]
    pub mon: MonHealthCheckSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonHealthCheckSpec {
    #[serde(default)]
    pub disabled: bool,
    /// e.g. "45s"
    pub interval: Option<String>,
    /// e.g. "10m"; "0" disables failover
    pub timeout: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSpec {
    #[serde(default)]
    pub enable: bool,
}

/// The status object of `CephCluster`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CephClusterStatus {
    pub phase: Option<String>,
    pub message: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    pub ceph: Option<CephHealthStatus>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CephHealthStatus {
    pub health: String,
    pub fsid: String,
    pub last_checked: String,
}

impl CephCluster {
    pub fn is_external(&self) -> bool {
        self.spec.external.enable
    }

    pub fn is_stretch(&self) -> bool {
        self.spec
            .mon
            .stretch_cluster
            .as_ref()
            .is_some_and(|s| !s.zones.is_empty())
    }

    pub fn arbiter_zone(&self) -> Option<&str> {
        self.spec
            .mon
            .stretch_cluster
            .as_ref()?
            .zones
            .iter()
            .find(|z| z.arbiter)
            .map(|z| z.name.as_str())
    }
}
