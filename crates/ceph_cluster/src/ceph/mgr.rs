use super::{command::CephClient, status::MgrMap};
use crate::util::errors::{Result, ResultExt};

impl CephClient {
    /// `mgr module enable <name> [--force]`
    pub async fn mgr_enable_module(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["mgr", "module", "enable", name];
        if force {
            args.push("--force");
        }
        self.run(&args)
            .await
            .with_context(|| format!("failed to enable mgr module {name}"))?;
        Ok(())
    }

    /// `mgr module disable <name>`
    pub async fn mgr_disable_module(&self, name: &str) -> Result<()> {
        self.run(&["mgr", "module", "disable", name])
            .await
            .with_context(|| format!("failed to disable mgr module {name}"))?;
        Ok(())
    }

    pub async fn mgr_dump(&self) -> Result<MgrMap> {
        self.run_json(&["mgr", "dump"]).await.context("failed to dump mgr map")
    }
}
