use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::v1::{conditions_schema, pools::ZoneSpec};

/// Gateway hook a script is attached to
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LuaScriptContext {
    #[default]
    PreRequest,
    PostRequest,
    Background,
    GetData,
    PutData,
}

impl fmt::Display for LuaScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LuaScriptContext::PreRequest => write!(f, "preRequest"),
            LuaScriptContext::PostRequest => write!(f, "postRequest"),
            LuaScriptContext::Background => write!(f, "background"),
            LuaScriptContext::GetData => write!(f, "getData"),
            LuaScriptContext::PutData => write!(f, "putData"),
        }
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CephLuaScript", group = "ceph.rook.io", version = "v1", namespaced)]
#[kube(status = "CephLuaScriptStatus", shortname = "cephlua")]
#[serde(rename_all = "camelCase")]
pub struct CephLuaScriptSpec {
    #[serde(default)]
    pub object_store_name: String,
    #[serde(default)]
    pub object_store_namespace: String,
    #[serde(default)]
    pub context: LuaScriptContext,
    #[serde(default)]
    pub tenant: String,
    /// Plain text source
    pub script: Option<String>,
    pub script_base64: Option<String>,
    #[serde(rename = "scriptURL")]
    pub script_url: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CephLuaScriptStatus {
    pub phase: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    /// Zone the script was written to
    pub zone: Option<ZoneSpec>,
}
