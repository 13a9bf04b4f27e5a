use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::{sync::Mutex, time::Duration};
use tracing::debug;

use crate::{ceph::CephClient, util::errors::Result};

/// How long a looked up crush location is trusted
pub const CRUSH_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct CachedLocation {
    pub location: BTreeMap<String, String>,
    pub last_synced: DateTime<Utc>,
}

/// Crush location per OSD per cluster namespace. Misses and expired entries are refreshed with
/// `osd find`.
#[derive(Clone, Default)]
pub struct OsdCrushLocationCache {
    entries: Arc<Mutex<HashMap<String, HashMap<i32, CachedLocation>>>>,
}

impl OsdCrushLocationCache {
    pub async fn location(
        &self,
        ceph: &CephClient,
        namespace: &str,
        osd_id: i32,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, String>> {
        let mut entries = self.entries.lock().await;
        let cluster = entries.entry(namespace.to_string()).or_default();
        if let Some(cached) = cluster.get(&osd_id) {
            let age = (now - cached.last_synced).to_std().unwrap_or(Duration::ZERO);
            if age < CRUSH_CACHE_TTL {
                return Ok(cached.location.clone());
            }
            debug!("crush location of osd.{} is {:?} old, refreshing", osd_id, age);
        }
        let found = ceph.osd_find(osd_id).await?;
        let mut location = found.crush_location;
        if !found.host.is_empty() {
            location.entry("host".to_string()).or_insert(found.host);
        }
        cluster.insert(
            osd_id,
            CachedLocation {
                location: location.clone(),
                last_synced: now,
            },
        );
        Ok(location)
    }

    /// Drops every entry of a deleted cluster
    pub async fn forget_cluster(&self, namespace: &str) {
        self.entries.lock().await.remove(namespace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceph::testing::MockExecutor;
    use serde_json::json;

    #[tokio::test]
    async fn lookups_are_cached_until_the_ttl() {
        let mock = MockExecutor::new();
        mock.on_json(
            "osd find 3",
            json!({"osd": 3, "host": "node-a", "crush_location": {"host": "node-a", "zone": "z1", "root": "default"}}),
        );
        let ceph = mock.client("rook-ceph");
        let cache = OsdCrushLocationCache::default();
        let start = Utc::now();

        let location = cache.location(&ceph, "rook-ceph", 3, start).await.unwrap();
        assert_eq!(location["zone"], "z1");
        cache
            .location(&ceph, "rook-ceph", 3, start + chrono::Duration::minutes(29))
            .await
            .unwrap();
        assert_eq!(mock.ceph_commands().len(), 1);

        cache
            .location(&ceph, "rook-ceph", 3, start + chrono::Duration::minutes(31))
            .await
            .unwrap();
        assert_eq!(mock.ceph_commands().len(), 2);

        cache.forget_cluster("rook-ceph").await;
        cache
            .location(&ceph, "rook-ceph", 3, start + chrono::Duration::minutes(31))
            .await
            .unwrap();
        assert_eq!(mock.ceph_commands(), vec!["osd find 3"; 3]);
    }
}
