use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::{path::PathBuf, process::Stdio, sync::Arc};
use thiserror::Error;
use tokio::{process::Command, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::util::errors::{Error, Result, StdError};

pub const CEPH_TOOL: &str = "ceph";
pub const RGW_ADMIN_TOOL: &str = "radosgw-admin";
pub const AUTH_TOOL: &str = "ceph-authtool";

/// No such file or directory
pub const ENOENT: i32 = 2;
/// Returned by `dashboard create-self-signed-cert` when a certificate is already present
pub const CERT_ALREADY_CONFIGURED: i32 = 5;
/// Invalid argument; modules report it while they are still loading
pub const EINVAL: i32 = 22;

/// Default directory holding the per-cluster config and admin keyring
pub const DEFAULT_DATA_DIR: &str = "/var/lib/rook";

/// Number of leading positional arguments kept in a command summary
const SUMMARY_ARGS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("`{summary}` exited with code {code}: {stderr}")]
    Exit { summary: String, code: i32, stderr: String },

    #[error("`{summary}` timed out after {timeout:?}")]
    Timeout { summary: String, timeout: Duration },

    #[error("failed to spawn `{summary}`: {reason}")]
    Spawn { summary: String, reason: String },

    #[error("`{summary}` was cancelled")]
    Cancelled { summary: String },
}

impl CommandError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }
}

/// Runs an external admin binary. Implemented by `ProcessExecutor` in production and by a
/// recording mock in tests.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> std::result::Result<CommandOutput, CommandError>;
}

/// Spawns the binary with `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> std::result::Result<CommandOutput, CommandError> {
        let summary = summarize(program, args);
        debug!("running `{}`", summary);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CommandError::Spawn {
                    summary,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(CommandError::Timeout { summary, timeout }),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            return Ok(CommandOutput { stdout, stderr });
        }

        // a missing code means the process was killed by a signal
        let code = output.status.code().unwrap_or(-1);
        warn!("`{}` exited with code {}", summary, code);
        Err(CommandError::Exit {
            summary,
            code,
            stderr: stderr.trim().to_string(),
        })
    }
}

/// Program and its leading positional arguments. Flags and anything after the first few words
/// are dropped so credentials never land in logs or status messages.
pub fn summarize(program: &str, args: &[String]) -> String {
    let mut words = vec![program.to_string()];
    words.extend(
        args.iter()
            .take_while(|a| !a.starts_with('-'))
            .take(SUMMARY_ARGS)
            .cloned(),
    );
    words.join(" ")
}

/// Where the admin tools find the cluster
#[derive(Debug, Clone, PartialEq)]
pub struct CephConnection {
    pub cluster_name: String,
    pub config_path: PathBuf,
    pub keyring_path: PathBuf,
    pub user: String,
}

impl CephConnection {
    pub fn for_cluster(namespace: &str, data_dir: &str) -> Self {
        let dir = PathBuf::from(data_dir).join(namespace);
        Self {
            cluster_name: namespace.to_string(),
            config_path: dir.join(format!("{namespace}.config")),
            keyring_path: dir.join("client.admin.keyring"),
            user: "client.admin".to_string(),
        }
    }

    fn connection_args(&self) -> Vec<String> {
        vec![
            format!("--cluster={}", self.cluster_name),
            format!("--conf={}", self.config_path.display()),
            format!("--name={}", self.user),
            format!("--keyring={}", self.keyring_path.display()),
        ]
    }
}

/// Admin command runner bound to one cluster
#[derive(Clone)]
pub struct CephClient {
    executor: Arc<dyn CommandExecutor>,
    conn: CephConnection,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CephClient {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        conn: CephConnection,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            conn,
            timeout,
            cancel,
        }
    }

    pub fn connection(&self) -> &CephConnection {
        &self.conn
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs `ceph <args>` with connection flags and JSON output
    pub async fn run(&self, args: &[&str]) -> std::result::Result<CommandOutput, CommandError> {
        let mut full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        full.push(format!("--connect-timeout={}", self.timeout.as_secs()));
        full.extend(self.conn.connection_args());
        full.push("--format".to_string());
        full.push("json".to_string());
        self.execute(CEPH_TOOL, full).await
    }

    /// Runs `ceph <args>` and parses the JSON reply
    pub async fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let output = self.run(args).await?;
        serde_json::from_str(&output.stdout).map_err(|e| {
            Error::StdError(StdError::DecodingError(format!(
                "failed to parse reply of `ceph {}`: {}",
                args.join(" "),
                e
            )))
        })
    }

    /// Runs `radosgw-admin <args>`; the gateway tool rejects `--connect-timeout`
    pub async fn run_radosgw_admin(&self, args: &[&str]) -> std::result::Result<CommandOutput, CommandError> {
        let mut full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        full.extend(self.conn.connection_args());
        self.execute(RGW_ADMIN_TOOL, full).await
    }

    /// Runs `ceph-authtool <args>`; it works on local files and takes no connection flags
    pub async fn run_authtool(&self, args: &[&str]) -> std::result::Result<CommandOutput, CommandError> {
        let full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.execute(AUTH_TOOL, full).await
    }

    async fn execute(&self, program: &str, args: Vec<String>) -> std::result::Result<CommandOutput, CommandError> {
        if self.cancel.is_cancelled() {
            return Err(CommandError::Cancelled {
                summary: summarize(program, &args),
            });
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CommandError::Cancelled { summary: summarize(program, &args) }),
            res = self.executor.execute(program, &args, self.timeout) => res,
        }
    }
}
