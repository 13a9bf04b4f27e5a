use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::GenericStatus;

/// Replication settings the disruption controller reads the failure domain from
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// CRUSH level data is spread across; `host` when empty
    #[serde(default)]
    pub failure_domain: String,
    #[serde(default)]
    pub replicated: ReplicatedSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedSpec {
    #[serde(default)]
    pub size: u32,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CephBlockPool", group = "ceph.rook.io", version = "v1", namespaced)]
#[kube(status = "GenericStatus", shortname = "cephbp")]
#[serde(rename_all = "camelCase")]
pub struct CephBlockPoolSpec {
    #[serde(flatten)]
    pub pool: PoolSpec,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CephFilesystem", group = "ceph.rook.io", version = "v1", namespaced)]
#[kube(status = "GenericStatus", shortname = "cephfs")]
#[serde(rename_all = "camelCase")]
pub struct CephFilesystemSpec {
    #[serde(default)]
    pub metadata_pool: PoolSpec,
    #[serde(default)]
    pub data_pools: Vec<PoolSpec>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CephObjectStore", group = "ceph.rook.io", version = "v1", namespaced)]
#[kube(status = "GenericStatus", shortname = "cephos")]
#[serde(rename_all = "camelCase")]
pub struct CephObjectStoreSpec {
    #[serde(default)]
    pub metadata_pool: PoolSpec,
    #[serde(default)]
    pub data_pool: PoolSpec,
    #[serde(default)]
    pub gateway: GatewaySpec,
    /// Multisite zone; the store name doubles as zone name when unset
    pub zone: Option<ZoneSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    #[serde(default = "default_gateway_port")]
    pub port: i32,
}

impl Default for GatewaySpec {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
        }
    }
}

fn default_gateway_port() -> i32 {
    80
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSpec {
    pub name: String,
}

impl CephObjectStore {
    /// RGW zone the store serves
    pub fn zone_name(&self) -> String {
        match &self.spec.zone {
            Some(zone) if !zone.name.is_empty() => zone.name.clone(),
            _ => self.metadata.name.clone().unwrap_or_default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|p| p == "Ready" || p == "Connected")
    }
}
