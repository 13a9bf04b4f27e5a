use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::{conditions_schema, GenericStatus};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CephBucketTopic", group = "ceph.rook.io", version = "v1", namespaced)]
#[kube(status = "CephBucketTopicStatus", shortname = "cephbt")]
#[serde(rename_all = "camelCase")]
pub struct CephBucketTopicSpec {
    pub object_store_name: String,
    pub object_store_namespace: String,
    /// Passed verbatim with every notification
    #[serde(default)]
    pub opaque_data: String,
    /// Queue notifications in the gateway instead of sending them inline
    #[serde(default)]
    pub persistent: bool,
    pub endpoint: TopicEndpointSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopicEndpointSpec {
    pub http: Option<HttpEndpointSpec>,
    pub amqp: Option<AmqpEndpointSpec>,
    pub kafka: Option<KafkaEndpointSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpEndpointSpec {
    pub uri: String,
    #[serde(default)]
    pub disable_verify_ssl: bool,
    #[serde(default)]
    pub send_cloud_events: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AmqpEndpointSpec {
    pub uri: String,
    pub exchange: String,
    #[serde(default)]
    pub disable_verify_ssl: bool,
    /// none, broker or routable
    #[serde(default = "default_ack_level")]
    pub ack_level: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KafkaEndpointSpec {
    pub uri: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub disable_verify_ssl: bool,
    /// none or broker
    #[serde(default = "default_ack_level")]
    pub ack_level: String,
}

fn default_ack_level() -> String {
    "broker".to_string()
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CephBucketTopicStatus {
    pub phase: Option<String>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    #[serde(rename = "ARN")]
    pub arn: Option<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CephBucketNotification", group = "ceph.rook.io", version = "v1", namespaced)]
#[kube(status = "GenericStatus", shortname = "cephbn")]
#[serde(rename_all = "camelCase")]
pub struct CephBucketNotificationSpec {
    /// Name of the `CephBucketTopic` in the same namespace
    pub topic: String,
    #[serde(default)]
    pub events: Vec<String>,
}

impl CephBucketTopic {
    pub fn arn(&self) -> Option<&str> {
        self.status.as_ref()?.arn.as_deref().filter(|a| !a.is_empty())
    }
}
