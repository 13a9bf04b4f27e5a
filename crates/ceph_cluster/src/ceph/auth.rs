use serde::Deserialize;

use super::command::CephClient;
use crate::util::errors::{Error, Result, ResultExt, StdError};

pub const ADMIN_USER: &str = "client.admin";

const ADMIN_CAPS: [(&str, &str); 4] = [
    ("mds", "allow *"),
    ("mon", "allow *"),
    ("osd", "allow *"),
    ("mgr", "allow *"),
];

/// Caps granted to mgr daemons
pub const MGR_CAPS: [(&str, &str); 3] = [("mon", "allow profile mgr"), ("mds", "allow *"), ("osd", "allow *")];

#[derive(Deserialize)]
struct KeyReply {
    key: String,
}

impl CephClient {
    /// Generates a fresh secret with `ceph-authtool --gen-print-key`
    pub async fn gen_secret(&self) -> Result<String> {
        let out = self
            .run_authtool(&["--gen-print-key"])
            .await
            .context("failed to generate secret")?;
        let key = out.stdout.trim().to_string();
        if key.is_empty() {
            return Err(Error::StdError(StdError::DecodingError(
                "ceph-authtool printed an empty key".to_string(),
            )));
        }
        Ok(key)
    }

    /// `auth get-or-create-key <entity> <caps...>`
    pub async fn auth_get_or_create_key(&self, entity: &str, caps: &[(&str, &str)]) -> Result<String> {
        let mut args = vec!["auth", "get-or-create-key", entity];
        for (service, cap) in caps {
            args.push(service);
            args.push(cap);
        }
        let reply: KeyReply = self
            .run_json(&args)
            .await
            .with_context(|| format!("failed to get or create key for {entity}"))?;
        Ok(reply.key)
    }

    /// `auth del <entity>`
    pub async fn auth_delete(&self, entity: &str) -> Result<()> {
        self.run(&["auth", "del", entity])
            .await
            .with_context(|| format!("failed to delete key for {entity}"))?;
        Ok(())
    }
}

/// Renders a keyring section for `entity`
pub fn keyring(entity: &str, key: &str, caps: &[(&str, &str)]) -> String {
    let mut out = format!("[{entity}]\n\tkey = {key}\n");
    for (service, cap) in caps {
        out.push_str(&format!("\tcaps {service} = \"{cap}\"\n"));
    }
    out
}

pub fn admin_keyring(admin_secret: &str) -> String {
    keyring(ADMIN_USER, admin_secret, &ADMIN_CAPS)
}

/// Keyring shared by every mon: the `mon.` key followed by the admin key
pub fn mon_keyring(mon_secret: &str, admin_secret: &str) -> String {
    format!(
        "{}\n{}",
        keyring("mon.", mon_secret, &[("mon", "allow *")]),
        admin_keyring(admin_secret)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceph::{command::CommandOutput, testing::MockExecutor};

    #[test]
    fn mon_keyring_holds_both_entities() {
        let ring = mon_keyring("MONKEY==", "ADMINKEY==");
        assert!(ring.starts_with("[mon.]\n\tkey = MONKEY==\n\tcaps mon = \"allow *\"\n"));
        assert!(ring.contains("[client.admin]\n\tkey = ADMINKEY==\n"));
        assert!(ring.contains("\tcaps mgr = \"allow *\"\n"));
    }

    #[tokio::test]
    async fn mgr_key_is_created_with_profile_caps() {
        let mock = MockExecutor::new();
        mock.on_json("auth get-or-create-key", serde_json::json!({"key": "AQD=="}));
        let key = mock
            .client("rook-ceph")
            .auth_get_or_create_key("mgr.a", &MGR_CAPS)
            .await
            .unwrap();
        assert_eq!(key, "AQD==");
        assert_eq!(
            mock.ceph_commands(),
            vec!["auth get-or-create-key mgr.a mon allow profile mgr mds allow * osd allow *"]
        );
    }

    #[tokio::test]
    async fn empty_generated_secret_is_an_error() {
        let mock = MockExecutor::new();
        mock.on("ceph-authtool", "--gen-print-key", Ok(CommandOutput::stdout("\n")));
        assert!(mock.client("rook-ceph").gen_secret().await.is_err());
    }
}
