use tracing::info;

use super::{command::CephClient, status::CrushFindResult};
use crate::util::errors::{Result, ResultExt};

impl CephClient {
    /// `osd find <id>`: the crush location of one OSD
    pub async fn osd_find(&self, id: i32) -> Result<CrushFindResult> {
        let id = id.to_string();
        self.run_json(&["osd", "find", &id])
            .await
            .with_context(|| format!("failed to find osd.{id}"))
    }

    /// `osd set-group noout <crush unit>`
    pub async fn osd_set_noout(&self, crush_unit: &str) -> Result<()> {
        self.run(&["osd", "set-group", "noout", crush_unit])
            .await
            .with_context(|| format!("failed to set noout on {crush_unit}"))?;
        info!("set noout on failure domain {}", crush_unit);
        Ok(())
    }

    /// `osd unset-group noout <crush unit>`
    pub async fn osd_unset_noout(&self, crush_unit: &str) -> Result<()> {
        self.run(&["osd", "unset-group", "noout", crush_unit])
            .await
            .with_context(|| format!("failed to unset noout on {crush_unit}"))?;
        info!("cleared noout on failure domain {}", crush_unit);
        Ok(())
    }
}
