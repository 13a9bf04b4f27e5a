//! Module enables that fail with EINVAL while the mgr is still loading its modules

use tracing::info;

use crate::{
    ceph::{
        command::EINVAL,
        retry::{execute_with_retry, DEFAULT_RETRIES, DEFAULT_RETRY_WAIT},
        CephClient,
    },
    util::errors::{Result, ResultExt},
};

pub const ROOK_MODULE: &str = "rook";
const BACKEND: &str = "rook";

/// `mgr module enable <name>`, retried while the mgr rejects it as not ready
pub async fn enable_module(ceph: &CephClient, name: &str, force: bool) -> Result<()> {
    let description = format!("enable mgr module {name}");
    execute_with_retry(
        ceph.cancel_token(),
        &description,
        DEFAULT_RETRIES,
        &[EINVAL],
        DEFAULT_RETRY_WAIT,
        || ceph.mgr_enable_module(name, force),
    )
    .await
}

/// Enables the rook orchestrator module and makes it the orchestrator backend
pub async fn configure(ceph: &CephClient) -> Result<()> {
    enable_module(ceph, ROOK_MODULE, true).await?;
    execute_with_retry(
        ceph.cancel_token(),
        "set orchestrator backend",
        DEFAULT_RETRIES,
        &[EINVAL],
        DEFAULT_RETRY_WAIT,
        || async {
            ceph.run(&["orch", "set", "backend", BACKEND])
                .await
                .context("failed to set orchestrator backend")?;
            Ok(())
        },
    )
    .await?;
    info!("orchestrator backend set to {}", BACKEND);
    Ok(())
}
