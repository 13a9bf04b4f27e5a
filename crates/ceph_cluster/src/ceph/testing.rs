//! Recording stand-in for the admin binaries

use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::command::{CephClient, CephConnection, CommandError, CommandExecutor, CommandOutput, DEFAULT_DATA_DIR};

type Reply = Result<CommandOutput, CommandError>;

struct Rule {
    program: String,
    prefix: String,
    replies: VecDeque<Reply>,
}

#[derive(Default)]
struct Inner {
    rules: Vec<Rule>,
    calls: Vec<String>,
}

/// Matches calls on program and a prefix of the space-joined arguments. Each rule replays its
/// queued replies in order and repeats the last one forever. Unmatched calls succeed with empty
/// output.
#[derive(Clone, Default)]
pub struct MockExecutor {
    inner: Arc<Mutex<Inner>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, program: &str, prefix: &str, reply: Reply) -> &Self {
        let mut inner = self.inner.lock().unwrap();
        if let Some(rule) = inner
            .rules
            .iter_mut()
            .find(|r| r.program == program && r.prefix == prefix)
        {
            rule.replies.push_back(reply);
        } else {
            inner.rules.push(Rule {
                program: program.to_string(),
                prefix: prefix.to_string(),
                replies: VecDeque::from([reply]),
            });
        }
        self
    }

    pub fn on_json(&self, prefix: &str, value: serde_json::Value) -> &Self {
        self.on("ceph", prefix, Ok(CommandOutput::stdout(value.to_string())))
    }

    pub fn exit(code: i32) -> CommandError {
        CommandError::Exit {
            summary: "mock".to_string(),
            code,
            stderr: String::new(),
        }
    }

    /// Every call with full arguments
    pub fn raw_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Every call with the trailing connection flags removed
    pub fn commands(&self) -> Vec<String> {
        self.raw_calls()
            .into_iter()
            .map(|c| {
                let cut = [" --connect-timeout=", " --cluster="]
                    .iter()
                    .filter_map(|m| c.find(m))
                    .min()
                    .unwrap_or(c.len());
                c[..cut].to_string()
            })
            .collect()
    }

    /// Calls to `ceph` only, without the program name and connection flags
    pub fn ceph_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| c.strip_prefix("ceph ").map(str::to_string))
            .collect()
    }

    pub fn client(&self, namespace: &str) -> CephClient {
        CephClient::new(
            Arc::new(self.clone()),
            CephConnection::for_cluster(namespace, DEFAULT_DATA_DIR),
            Duration::from_secs(15),
            CancellationToken::new(),
        )
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn execute(&self, program: &str, args: &[String], _timeout: Duration) -> Reply {
        let joined = args.join(" ");
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("{program} {joined}"));

        // longest matching prefix wins
        let rule = inner
            .rules
            .iter_mut()
            .filter(|r| r.program == program && joined.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len());
        match rule {
            Some(rule) if rule.replies.len() > 1 => rule.replies.pop_front().unwrap(),
            Some(rule) => rule.replies.front().cloned().unwrap(),
            None => Ok(CommandOutput::default()),
        }
    }
}
