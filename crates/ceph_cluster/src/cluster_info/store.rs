use k8s_openapi::{
    api::core::v1::{ConfigMap, Secret},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    ByteString,
};
use kube::{
    api::{Api, ObjectMeta, PostParams},
    client::Client,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::*;
use crate::{
    ceph::{auth, CephClient},
    util::{
        errors::ResultExt,
        k8s::{create_or_update, get_opt, labels, FIELD_MANAGER, MANAGED_BY_LABEL},
    },
};

/// Reads and writes the cluster identity secret and the endpoints configmap of one cluster
#[derive(Clone)]
pub struct ClusterInfoStore {
    client: Client,
    namespace: String,
    owner: Option<OwnerReference>,
}

impl ClusterInfoStore {
    /// `owner` is the `CephCluster`; without one a missing identity is never generated
    pub fn new(client: Client, namespace: &str, owner: Option<OwnerReference>) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            owner,
        }
    }

    /// Loads the identity secret, generating fsid and keys on first use, then hydrates the
    /// monitor map from the endpoints configmap
    pub async fn create_or_load(&self, ceph: &CephClient) -> Result<ClusterInfo> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut info = match get_opt(&secrets, MON_SECRET_NAME)
            .await
            .context("failed to get mon secrets")?
        {
            Some(secret) => {
                debug!("found existing monitor secrets for cluster {}", self.namespace);
                identity_from_secret(&self.namespace, &secret)?
            }
            None => {
                let Some(owner) = &self.owner else {
                    return Err(Error::dependency(
                        MON_SECRET_NAME,
                        "cluster identity secret does not exist and will not be generated",
                    ));
                };
                let info = self.generate(ceph).await?;
                info!("creating mon secrets for a new cluster in {}", self.namespace);
                secrets
                    .create(&PostParams::default(), &identity_secret(&info, owner))
                    .await
                    .context("failed to save mon secrets")?;
                info
            }
        };

        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Some(cm) = get_opt(&configmaps, ENDPOINTS_CONFIGMAP)
            .await
            .context("failed to get mon endpoints")?
        {
            hydrate_endpoints(&mut info, &cm.data.unwrap_or_default());
        }
        debug!("loaded cluster info {:?}", info);
        Ok(info)
    }

    async fn generate(&self, ceph: &CephClient) -> Result<ClusterInfo> {
        let mut info = ClusterInfo::new(&self.namespace);
        info.fsid = uuid::Uuid::new_v4().to_string();
        info.mon_secret = ceph.gen_secret().await.context("failed to generate mon secret")?;
        info.admin_secret = ceph
            .gen_secret()
            .await
            .context("failed to generate admin secret")?;
        Ok(info)
    }

    /// Writes the whole monitor map in one configmap update
    pub async fn save(&self, info: &ClusterInfo) -> Result<()> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let desired = ConfigMap {
            metadata: ObjectMeta {
                name: Some(ENDPOINTS_CONFIGMAP.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels(&[(MANAGED_BY_LABEL, FIELD_MANAGER)])),
                owner_references: self.owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            data: Some(endpoints_data(info)?),
            ..Default::default()
        };
        create_or_update(&configmaps, &desired, |existing, desired| {
            existing.data != desired.data
        })
        .await
        .context("failed to save mon endpoints")?;
        info!("saved mon endpoints {} maxMonId={}", info.endpoints(), info.max_mon_id);
        Ok(())
    }

    /// Records `value` as the highest mon id handed out. With `require_increment` the value must
    /// be exactly one above the stored id; otherwise lower values are ignored.
    pub async fn commit_max_mon_id(
        &self,
        info: &mut ClusterInfo,
        value: i32,
        require_increment: bool,
    ) -> Result<()> {
        if require_increment && value != info.max_mon_id + 1 {
            return Err(Error::requeue(
                StdError::InvalidArgument(format!(
                    "not committing max mon id {value}: expected {}",
                    info.max_mon_id + 1
                )),
                crate::util::errors::TRANSIENT_REQUEUE,
            ));
        }
        if value <= info.max_mon_id {
            warn!(
                "not committing max mon id {} since it is not above {}",
                value, info.max_mon_id
            );
            return Ok(());
        }
        let previous = info.max_mon_id;
        info.max_mon_id = value;
        if let Err(e) = self.save(info).await {
            // the in-memory value is uncommitted until the configmap write succeeds
            info.max_mon_id = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Writes the ceph.conf and admin keyring the admin tools read
    pub async fn write_connection_config(&self, info: &ClusterInfo, ceph: &CephClient) -> Result<()> {
        let conn = ceph.connection();
        if let Some(dir) = conn.config_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        tokio::fs::write(&conn.keyring_path, auth::admin_keyring(&info.admin_secret))
            .await
            .context("failed to write admin keyring")?;
        tokio::fs::write(&conn.config_path, connection_config(info, &conn.keyring_path))
            .await
            .context("failed to write connection config")?;
        debug!("wrote connection config {}", conn.config_path.display());
        Ok(())
    }
}

fn identity_from_secret(namespace: &str, secret: &Secret) -> Result<ClusterInfo> {
    let data = secret.data.clone().unwrap_or_default();
    let read = |key: &str| -> Result<String> {
        data.get(key)
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::fatal(
                    "CorruptMonSecret",
                    format!("secret {MON_SECRET_NAME} has no '{key}'"),
                )
            })
    };
    let mut info = ClusterInfo::new(namespace);
    info.fsid = read(FSID_KEY)?;
    info.mon_secret = read(MON_SECRET_KEY)?;
    info.admin_secret = read(ADMIN_SECRET_KEY)?;
    if let Ok(name) = read(CLUSTER_NAME_KEY) {
        info.name = name;
    }
    Ok(info)
}

fn identity_secret(info: &ClusterInfo, owner: &OwnerReference) -> Secret {
    let data: BTreeMap<String, ByteString> = [
        (CLUSTER_NAME_KEY, &info.name),
        (FSID_KEY, &info.fsid),
        (MON_SECRET_KEY, &info.mon_secret),
        (ADMIN_SECRET_KEY, &info.admin_secret),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
    .collect();
    Secret {
        metadata: ObjectMeta {
            name: Some(MON_SECRET_NAME.to_string()),
            namespace: Some(info.namespace.clone()),
            labels: Some(labels(&[(MANAGED_BY_LABEL, FIELD_MANAGER)])),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("kubernetes.io/rook".to_string()),
        ..Default::default()
    }
}
