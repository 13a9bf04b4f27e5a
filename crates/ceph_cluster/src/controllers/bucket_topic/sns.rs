//! The gateway's SNS-compatible topic API, signed with AWS signature version 2

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, DATE};
use sha1::Sha1;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    api::v1::notifications::CephBucketTopicSpec,
    util::errors::{Error, Result, StdError},
};

type HmacSha1 = Hmac<Sha1>;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const NOT_FOUND_CODE: &str = "NotFound";

pub fn string_to_sign(method: &str, content_type: &str, date: &str, path: &str) -> String {
    format!("{method}\n\n{content_type}\n{date}\n{path}")
}

/// base64(HMAC-SHA1(secret, string to sign))
pub fn sign_v2(method: &str, content_type: &str, date: &str, path: &str, secret: &str) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::StdError(StdError::InvalidArgument(format!("unusable secret key: {e}"))))?;
    mac.update(string_to_sign(method, content_type, date, path).as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn authorization_header(access_key: &str, signature: &str) -> String {
    format!("AWS {access_key}:{signature}")
}

/// Topic attributes for the configured endpoint. The last endpoint kind wins when several are
/// set.
pub fn topic_attributes(spec: &CephBucketTopicSpec) -> Vec<(&'static str, String)> {
    let mut attrs = vec![
        ("OpaqueData", spec.opaque_data.clone()),
        ("persistent", spec.persistent.to_string()),
    ];
    let mut set = |key: &'static str, value: String| {
        attrs.retain(|(k, _)| *k != key);
        attrs.push((key, value));
    };
    if let Some(amqp) = &spec.endpoint.amqp {
        set("push-endpoint", amqp.uri.clone());
        set("amqp-exchange", amqp.exchange.clone());
        set("amqp-ack-level", amqp.ack_level.clone());
        set("verify-ssl", (!amqp.disable_verify_ssl).to_string());
    }
    if let Some(http) = &spec.endpoint.http {
        set("push-endpoint", http.uri.clone());
        set("verify-ssl", (!http.disable_verify_ssl).to_string());
        if http.send_cloud_events {
            set("cloudevents", "true".to_string());
        }
    }
    if let Some(kafka) = &spec.endpoint.kafka {
        set("push-endpoint", kafka.uri.clone());
        set("use-ssl", kafka.use_ssl.to_string());
        set("kafka-ack-level", kafka.ack_level.clone());
        set("verify-ssl", (!kafka.disable_verify_ssl).to_string());
    }
    attrs
}

/// Query protocol parameters of `CreateTopic`
pub fn create_topic_params(name: &str, attrs: &[(&str, String)]) -> Vec<(String, String)> {
    let mut params = vec![
        ("Action".to_string(), "CreateTopic".to_string()),
        ("Name".to_string(), name.to_string()),
    ];
    for (i, (key, value)) in attrs.iter().enumerate() {
        params.push((format!("Attributes.entry.{}.key", i + 1), key.to_string()));
        params.push((format!("Attributes.entry.{}.value", i + 1), value.clone()));
    }
    params
}

/// Text of the first `<tag>` element of an XML reply
pub fn xml_element<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let len = body[start..].find(&close)?;
    Some(body[start..start + len].trim())
}

/// `arn:aws:sns:<zonegroup>::<topic>`; the service must be sns and the topic present
pub fn validate_arn(arn: &str) -> Result<()> {
    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    let [prefix, _, service, _, _, resource] = parts.as_slice() else {
        return Err(Error::fatal("InvalidTopicArn", format!("{arn:?} is not an ARN")));
    };
    if *prefix != "arn" {
        return Err(Error::fatal("InvalidTopicArn", format!("{arn:?} is not an ARN")));
    }
    if !service.eq_ignore_ascii_case("sns") {
        return Err(Error::fatal("InvalidTopicArn", format!("ARN {arn:?} must have the 'sns' service")));
    }
    if resource.is_empty() {
        return Err(Error::fatal("InvalidTopicArn", format!("ARN {arn:?} names no topic")));
    }
    Ok(())
}

pub struct SnsClient {
    http: reqwest::Client,
    endpoint: String,
    access_key: String,
    secret_key: String,
}

impl SnsClient {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::StdError(StdError::HttpError(format!("failed to build http client: {e}"))))?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    async fn call(&self, params: &[(String, String)]) -> Result<String> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S %z").to_string();
        let signature = sign_v2("POST", FORM_CONTENT_TYPE, &date, "/", &self.secret_key)?;
        let body = serde_urlencoded::to_string(params)
            .map_err(|e| Error::StdError(StdError::SerializationError(e.to_string())))?;

        let response = self
            .http
            .post(format!("{}/", self.endpoint))
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header(DATE, &date)
            .header(AUTHORIZATION, authorization_header(&self.access_key, &signature))
            .body(body)
            .send()
            .await
            .map_err(|e| Error::StdError(StdError::HttpError(format!("request to {} failed: {e}", self.endpoint))))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::StdError(StdError::HttpError(e.to_string())))?;
        if !status.is_success() {
            let code = xml_element(&text, "Code").unwrap_or_default();
            return Err(Error::StdError(StdError::HttpError(format!("{status} {code}"))));
        }
        Ok(text)
    }

    /// Creates or updates the topic and returns its ARN
    pub async fn create_topic(&self, name: &str, attrs: &[(&str, String)]) -> Result<String> {
        let reply = self.call(&create_topic_params(name, attrs)).await?;
        let arn = xml_element(&reply, "TopicArn")
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::StdError(StdError::DecodingError("CreateTopic returned no TopicArn".to_string())))?;
        info!("topic {} provisioned as {}", name, arn);
        Ok(arn.to_string())
    }

    /// Deletes the topic; one that is already gone counts as deleted
    pub async fn delete_topic(&self, arn: &str) -> Result<()> {
        let params = vec![
            ("Action".to_string(), "DeleteTopic".to_string()),
            ("TopicArn".to_string(), arn.to_string()),
        ];
        match self.call(&params).await {
            Ok(_) => debug!("deleted topic {}", arn),
            Err(Error::StdError(StdError::HttpError(msg))) if msg.ends_with(NOT_FOUND_CODE) => {
                warn!("topic {} was already deleted", arn)
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::notifications::{HttpEndpointSpec, KafkaEndpointSpec, TopicEndpointSpec};

    #[test]
    fn string_to_sign_has_an_empty_md5_line() {
        assert_eq!(
            string_to_sign("POST", FORM_CONTENT_TYPE, "Tue, 27 Mar 2007 19:36:42 +0000", "/"),
            "POST\n\napplication/x-www-form-urlencoded; charset=utf-8\nTue, 27 Mar 2007 19:36:42 +0000\n/"
        );
    }

    #[test]
    fn signatures_depend_on_the_secret() {
        let date = "Tue, 27 Mar 2007 19:36:42 +0000";
        let a = sign_v2("POST", FORM_CONTENT_TYPE, date, "/", "secret-a").unwrap();
        let again = sign_v2("POST", FORM_CONTENT_TYPE, date, "/", "secret-a").unwrap();
        let b = sign_v2("POST", FORM_CONTENT_TYPE, date, "/", "secret-b").unwrap();
        assert_eq!(a, again);
        assert_ne!(a, b);
        // 20 byte digest
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 20);
        assert_eq!(authorization_header("AKID", &a), format!("AWS AKID:{a}"));
    }

    #[test]
    fn kafka_topics_carry_ack_level_and_ssl() {
        let spec = CephBucketTopicSpec {
            object_store_name: "store".into(),
            object_store_namespace: "rook-ceph".into(),
            opaque_data: "me@example.com".into(),
            persistent: true,
            endpoint: TopicEndpointSpec {
                kafka: Some(KafkaEndpointSpec {
                    uri: "kafka://broker:9092".into(),
                    use_ssl: true,
                    disable_verify_ssl: true,
                    ack_level: "broker".into(),
                }),
                ..Default::default()
            },
        };
        let attrs = topic_attributes(&spec);
        let get = |k: &str| attrs.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("push-endpoint"), Some("kafka://broker:9092"));
        assert_eq!(get("use-ssl"), Some("true"));
        assert_eq!(get("verify-ssl"), Some("false"));
        assert_eq!(get("persistent"), Some("true"));
        assert_eq!(get("OpaqueData"), Some("me@example.com"));

        let params = create_topic_params("orders", &attrs);
        assert_eq!(params[0], ("Action".to_string(), "CreateTopic".to_string()));
        assert_eq!(params[1], ("Name".to_string(), "orders".to_string()));
        assert_eq!(params[2], ("Attributes.entry.1.key".to_string(), "OpaqueData".to_string()));
    }

    #[test]
    fn http_topics_may_send_cloud_events() {
        let spec = CephBucketTopicSpec {
            endpoint: TopicEndpointSpec {
                http: Some(HttpEndpointSpec {
                    uri: "http://hook:8080".into(),
                    disable_verify_ssl: false,
                    send_cloud_events: true,
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let attrs = topic_attributes(&spec);
        assert!(attrs.contains(&("cloudevents", "true".to_string())));
        assert!(attrs.contains(&("verify-ssl", "true".to_string())));
    }

    #[test]
    fn arn_is_read_from_the_reply() {
        let reply = "<CreateTopicResponse><CreateTopicResult><TopicArn>arn:aws:sns:zg::orders</TopicArn>\
                     </CreateTopicResult></CreateTopicResponse>";
        assert_eq!(xml_element(reply, "TopicArn"), Some("arn:aws:sns:zg::orders"));
        assert_eq!(xml_element(reply, "Code"), None);
    }

    #[test]
    fn arns_must_name_an_sns_topic() {
        assert!(validate_arn("arn:aws:sns:zg::orders").is_ok());
        assert!(validate_arn("arn:aws:s3:zg::orders").is_err());
        assert!(validate_arn("arn:aws:sns:zg::").is_err());
        assert!(validate_arn("orders").is_err());
    }
}
