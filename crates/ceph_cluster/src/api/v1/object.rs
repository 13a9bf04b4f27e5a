use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::GenericStatus;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CephObjectRealm", group = "ceph.rook.io", version = "v1", namespaced)]
#[kube(status = "GenericStatus", shortname = "cephor")]
#[serde(rename_all = "camelCase")]
pub struct CephObjectRealmSpec {
    /// Pull the realm from a peer cluster instead of creating it
    pub pull: Option<PullSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullSpec {
    /// Gateway endpoint of the cluster that owns the realm
    pub endpoint: String,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CephObjectZoneGroup", group = "ceph.rook.io", version = "v1", namespaced)]
#[kube(status = "GenericStatus", shortname = "cephozg")]
#[serde(rename_all = "camelCase")]
pub struct CephObjectZoneGroupSpec {
    /// Name of the `CephObjectRealm` in the same namespace
    pub realm: String,
}

impl CephObjectRealm {
    /// Secret holding the system user keys used for `realm pull`
    pub fn keys_secret_name(&self) -> String {
        format!("{}-keys", self.metadata.name.clone().unwrap_or_default())
    }
}
