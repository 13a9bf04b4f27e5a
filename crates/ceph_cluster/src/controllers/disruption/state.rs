//! Drain window state persisted in the `rook-ceph-pdbstatemap` configmap

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ObjectMeta},
    Client,
};
use std::collections::BTreeMap;
use tracing::warn;

use crate::util::{
    errors::Result,
    k8s::{create_or_update, get_opt, labels, MANAGED_BY_LABEL},
};

pub const PDB_STATE_CONFIGMAP: &str = "rook-ceph-pdbstatemap";
pub const DISABLED_FAILURE_DOMAIN_KEY: &str = "disabled-failure-domain";
pub const PG_HEALTH_CHECK_KEY: &str = "pg-health-check-duration";
const NOOUT_SUFFIX: &str = "-noout-last-set-at";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PdbState {
    /// Failure domain whose OSD budgets are lifted
    pub chosen: Option<String>,
    /// When PGs were first seen unclean while a domain was chosen
    pub pg_unhealthy_since: Option<DateTime<Utc>>,
    /// When `noout` was first set per failure domain
    pub noout_set_at: BTreeMap<String, DateTime<Utc>>,
}

fn parse_time(key: &str, raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            warn!("ignoring unparsable timestamp {}={:?}: {}", key, raw, e);
            None
        }
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl PdbState {
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let chosen = data
            .get(DISABLED_FAILURE_DOMAIN_KEY)
            .filter(|d| !d.is_empty())
            .cloned();
        let pg_unhealthy_since = data
            .get(PG_HEALTH_CHECK_KEY)
            .and_then(|raw| parse_time(PG_HEALTH_CHECK_KEY, raw));
        let noout_set_at = data
            .iter()
            .filter_map(|(key, raw)| {
                let domain = key.strip_suffix(NOOUT_SUFFIX)?;
                Some((domain.to_string(), parse_time(key, raw)?))
            })
            .collect();
        Self {
            chosen,
            pg_unhealthy_since,
            noout_set_at,
        }
    }

    pub fn to_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        data.insert(
            DISABLED_FAILURE_DOMAIN_KEY.to_string(),
            self.chosen.clone().unwrap_or_default(),
        );
        data.insert(
            PG_HEALTH_CHECK_KEY.to_string(),
            self.pg_unhealthy_since.as_ref().map(format_time).unwrap_or_default(),
        );
        for (domain, at) in &self.noout_set_at {
            data.insert(format!("{domain}{NOOUT_SUFFIX}"), format_time(at));
        }
        data
    }

    pub async fn load(client: &Client, namespace: &str) -> Result<Self> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let cm = get_opt(&api, PDB_STATE_CONFIGMAP).await?;
        Ok(cm
            .and_then(|cm| cm.data)
            .map(|data| Self::from_data(&data))
            .unwrap_or_default())
    }

    pub async fn save(&self, client: &Client, namespace: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let desired = ConfigMap {
            metadata: ObjectMeta {
                name: Some(PDB_STATE_CONFIGMAP.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels(&[(MANAGED_BY_LABEL, "ceph-operator")])),
                ..Default::default()
            },
            data: Some(self.to_data()),
            ..Default::default()
        };
        create_or_update(&api, &desired, |existing, desired| existing.data != desired.data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn state_survives_the_configmap() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let state = PdbState {
            chosen: Some("zone-a".into()),
            pg_unhealthy_since: None,
            noout_set_at: BTreeMap::from([("zone-a".to_string(), at)]),
        };
        let data = state.to_data();
        assert_eq!(data["disabled-failure-domain"], "zone-a");
        assert_eq!(data["zone-a-noout-last-set-at"], "2024-05-01T12:00:00Z");
        assert_eq!(data["pg-health-check-duration"], "");
        assert_eq!(PdbState::from_data(&data), state);
    }

    #[test]
    fn garbage_timestamps_are_dropped() {
        let data = BTreeMap::from([
            ("disabled-failure-domain".to_string(), String::new()),
            ("pg-health-check-duration".to_string(), "yesterday".to_string()),
            ("zone-b-noout-last-set-at".to_string(), "not a time".to_string()),
        ]);
        assert_eq!(PdbState::from_data(&data), PdbState::default());
    }
}
