use tracing::info;

use super::{
    command::CephClient,
    status::{CephStatus, CephVersion, DaemonVersions, MonStatusResponse},
};
use crate::util::errors::{Error, Result, ResultExt, StdError};

impl CephClient {
    /// Live quorum and monmap
    pub async fn mon_quorum_status(&self) -> Result<MonStatusResponse> {
        self.run_json(&["quorum_status"])
            .await
            .context("failed to get quorum status")
    }

    pub async fn status(&self) -> Result<CephStatus> {
        self.run_json(&["status"]).await.context("failed to get ceph status")
    }

    /// `mon remove <name>`
    pub async fn mon_remove(&self, name: &str) -> Result<()> {
        self.run(&["mon", "remove", name])
            .await
            .with_context(|| format!("failed to remove mon {name} from quorum"))?;
        info!("removed mon {} from the monmap", name);
        Ok(())
    }

    /// Makes `name` the tiebreaker of a stretch cluster
    pub async fn mon_set_tiebreaker(&self, name: &str) -> Result<()> {
        self.run(&["mon", "set_new_tiebreaker", name])
            .await
            .with_context(|| format!("failed to make mon {name} the tiebreaker"))?;
        info!("mon {} is the new tiebreaker", name);
        Ok(())
    }

    /// `config set <who> <key> <value>`
    pub async fn config_set(&self, who: &str, key: &str, value: &str) -> Result<()> {
        self.run(&["config", "set", who, key, value])
            .await
            .with_context(|| format!("failed to set {key} for {who}"))?;
        Ok(())
    }

    /// `config get <who> <key>`; an unset key reads as an empty string
    pub async fn config_get(&self, who: &str, key: &str) -> Result<String> {
        let out = self
            .run(&["config", "get", who, key])
            .await
            .with_context(|| format!("failed to get {key} for {who}"))?;
        let raw = out.stdout.trim();
        // json output quotes strings; numbers and bools come back bare
        Ok(match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::String(s)) => s,
            Ok(serde_json::Value::Null) => String::new(),
            Ok(other) => other.to_string(),
            Err(_) => raw.to_string(),
        })
    }

    /// Lowest version any running mon reports
    pub async fn mon_version(&self) -> Result<CephVersion> {
        let versions: DaemonVersions = self.run_json(&["versions"]).await.context("failed to get versions")?;
        versions
            .mon
            .keys()
            .filter_map(|banner| CephVersion::parse(banner))
            .min()
            .ok_or_else(|| Error::StdError(StdError::DecodingError("no mon versions reported".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use crate::ceph::{command::CommandOutput, status::CephVersion, testing::MockExecutor};

    #[tokio::test]
    async fn config_get_unquotes_strings() {
        let mock = MockExecutor::new();
        mock.on("ceph", "config get mgr mgr/dashboard/url_prefix", Ok(CommandOutput::stdout("\"/ceph\"\n")));
        mock.on("ceph", "config get mgr mgr/dashboard/ssl", Ok(CommandOutput::stdout("true")));
        let client = mock.client("rook-ceph");
        assert_eq!(client.config_get("mgr", "mgr/dashboard/url_prefix").await.unwrap(), "/ceph");
        assert_eq!(client.config_get("mgr", "mgr/dashboard/ssl").await.unwrap(), "true");
        assert_eq!(client.config_get("mgr", "mgr/dashboard/server_port").await.unwrap(), "");
    }

    #[tokio::test]
    async fn mon_version_is_the_oldest_running() {
        let mock = MockExecutor::new();
        mock.on_json(
            "versions",
            serde_json::json!({"mon": {
                "ceph version 16.2.6 (abc) pacific (stable)": 1,
                "ceph version 16.2.7 (def) pacific (stable)": 2
            }}),
        );
        let version = mock.client("rook-ceph").mon_version().await.unwrap();
        assert_eq!(version, CephVersion::new(16, 2, 6));
    }
}
