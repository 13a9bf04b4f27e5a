use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::time::Duration;
use tracing::warn;

use crate::ceph::command::DEFAULT_DATA_DIR;

pub const ENV_PREFIX: &str = "CEPH_OPERATOR_";

/// Operator wide settings. Per-cluster values in the `CephCluster` spec take precedence where
/// both exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Namespace the operator runs in, used for its own events
    pub namespace: String,
    /// Timeout for every admin command
    pub command_timeout: Duration,
    pub mon_health_interval: Duration,
    /// 0 disables mon failover
    pub mon_out_timeout: Duration,
    pub osd_maintenance_timeout: Duration,
    /// Used when the cluster leaves `pgHealthCheckTimeout` at 0
    pub pg_health_check_timeout: Duration,
    pub event_debounce: Duration,
    pub status_update_retries: usize,
    pub metrics_bind_address: String,
    /// Directory holding the generated ceph config and admin keyring per cluster
    pub data_dir: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "rook-ceph".to_string(),
            command_timeout: Duration::from_secs(15),
            mon_health_interval: Duration::from_secs(45),
            mon_out_timeout: Duration::from_secs(10 * 60),
            osd_maintenance_timeout: Duration::from_secs(30 * 60),
            pg_health_check_timeout: Duration::from_secs(15 * 60),
            event_debounce: Duration::from_secs(5 * 60),
            status_update_retries: 5,
            metrics_bind_address: "0.0.0.0:8080".to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Reads `CEPH_OPERATOR_*` variables on top of the defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let d = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        Self {
            namespace: get("NAMESPACE").unwrap_or(d.namespace),
            command_timeout: duration_or(get("COMMAND_TIMEOUT"), "COMMAND_TIMEOUT", d.command_timeout),
            mon_health_interval: duration_or(
                get("MON_HEALTH_INTERVAL"),
                "MON_HEALTH_INTERVAL",
                d.mon_health_interval,
            ),
            mon_out_timeout: duration_or(get("MON_OUT_TIMEOUT"), "MON_OUT_TIMEOUT", d.mon_out_timeout),
            osd_maintenance_timeout: duration_or(
                get("OSD_MAINTENANCE_TIMEOUT"),
                "OSD_MAINTENANCE_TIMEOUT",
                d.osd_maintenance_timeout,
            ),
            pg_health_check_timeout: duration_or(
                get("PG_HEALTH_CHECK_TIMEOUT"),
                "PG_HEALTH_CHECK_TIMEOUT",
                d.pg_health_check_timeout,
            ),
            event_debounce: duration_or(get("EVENT_DEBOUNCE"), "EVENT_DEBOUNCE", d.event_debounce),
            status_update_retries: parsed_or(
                get("STATUS_UPDATE_RETRIES"),
                "STATUS_UPDATE_RETRIES",
                d.status_update_retries,
            ),
            metrics_bind_address: get("METRICS_BIND_ADDRESS").unwrap_or(d.metrics_bind_address),
            data_dir: get("DATA_DIR").unwrap_or(d.data_dir),
        }
    }
}

fn parsed_or<T: FromStr>(raw: Option<String>, name: &str, default: T) -> T {
    match raw {
        None => default,
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring invalid {}{}={:?}", ENV_PREFIX, name, v);
            default
        }),
    }
}

fn duration_or(raw: Option<String>, name: &str, default: Duration) -> Duration {
    match raw {
        None => default,
        Some(v) => parse_duration(&v).unwrap_or_else(|| {
            warn!("ignoring invalid {}{}={:?}", ENV_PREFIX, name, v);
            default
        }),
    }
}

/// Parses durations such as "45s", "10m", "1h", "1m30s" or a bare number of seconds
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let value: u64 = number.parse().ok()?;
        number.clear();
        let unit = match c {
            'h' => 3600,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                total += Duration::from_millis(value);
                continue;
            }
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        total += Duration::from_secs(value * unit);
    }
    if !number.is_empty() {
        return None;
    }
    Some(total)
}
