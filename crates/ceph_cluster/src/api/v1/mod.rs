use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod cephcluster;
pub mod luascript;
pub mod notifications;
pub mod object;
pub mod pools;

pub const API_GROUP: &str = "ceph.rook.io";
pub const API_VERSION: &str = "ceph.rook.io/v1";

/// Finalizer for a kind, e.g. `cephcluster.ceph.rook.io`
pub fn finalizer_name(kind: &str) -> String {
    format!("{}.{}", kind.to_lowercase(), API_GROUP)
}

/// Status shared by every kind besides `CephCluster`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenericStatus {
    pub phase: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
}

pub fn conditions_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    schema_from(serde_json::json!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "lastTransitionTime",
                "message",
                "reason",
                "status",
                "type"
            ],
        },
    }))
}

/// Embedded core types (affinity, tolerations) are kept opaque in the CRD schema
pub fn preserve_unknown_object(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    schema_from(serde_json::json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    }))
}

pub fn preserve_unknown_list(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    schema_from(serde_json::json!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true,
        },
    }))
}

fn schema_from(value: serde_json::Value) -> schemars::schema::Schema {
    // only fails for non-object values
    serde_json::from_value(value).unwrap_or(schemars::schema::Schema::Bool(true))
}
