//! Mgr lifecycle: daemons, their services and the mgr modules the cluster asks for

pub mod dashboard;
pub mod orchestrator;
pub mod spec;

use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{Secret, Service},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    api::{Api, DeleteParams, ListParams},
    Client, ResourceExt,
};
use std::collections::BTreeSet;
use tracing::*;

use self::spec::{
    deployment_needs_update, keyring_secret_name, metrics_service, mgr_deployment, mgr_keyring_secret, service_needs_update,
    MgrSpecParams,
};
use crate::{
    api::v1::cephcluster::{CephCluster, MgrModuleSpec},
    ceph::{auth::MGR_CAPS, CephClient},
    cluster_info::{index_to_name, ClusterInfo},
    controllers::mon::spec::DAEMON_ID_LABEL,
    util::{
        errors::{Error, Result, ResultExt, StdError, TRANSIENT_REQUEUE},
        k8s::{create_or_update, delete_if_exists, namespace_of, owner_reference},
    },
};

pub const MGR_APP: &str = "rook-ceph-mgr";
pub const METRICS_SERVICE: &str = "rook-ceph-mgr";
pub const METRICS_PORT: i32 = 9283;
pub const MAX_MGR_COUNT: i32 = 2;
pub const PROMETHEUS_MODULE: &str = "prometheus";
pub const CRASH_MODULE: &str = "crash";

/// Modules the operator configures itself; the spec may not list them
const MANAGED_MODULES: [&str; 4] = [
    dashboard::DASHBOARD_MODULE,
    PROMETHEUS_MODULE,
    CRASH_MODULE,
    orchestrator::ROOK_MODULE,
];

/// Number of mgr daemons: at least one, at most two
pub fn mgr_count(requested: i32) -> i32 {
    if requested < 1 {
        return 1;
    }
    if requested > MAX_MGR_COUNT {
        warn!("mgr count {} exceeds the maximum, running {} mgrs", requested, MAX_MGR_COUNT);
        return MAX_MGR_COUNT;
    }
    requested
}

pub fn daemon_ids(count: i32) -> Vec<String> {
    (0..mgr_count(count)).map(index_to_name).collect()
}

pub fn validate_modules(modules: &[MgrModuleSpec]) -> Result<()> {
    for module in modules {
        if module.name.is_empty() {
            return Err(Error::Invalid("mgr module name must not be empty".to_string()));
        }
        if MANAGED_MODULES.contains(&module.name.as_str()) {
            return Err(Error::Invalid(format!(
                "mgr module {:?} is configured by the operator and cannot be listed",
                module.name
            )));
        }
    }
    Ok(())
}

pub struct MgrCluster {
    client: Client,
    ceph: CephClient,
    cluster: CephCluster,
    namespace: String,
    owner: Option<OwnerReference>,
}

impl MgrCluster {
    pub fn new(client: Client, ceph: CephClient, cluster: &CephCluster) -> Result<Self> {
        Ok(Self {
            namespace: namespace_of(cluster)?,
            owner: Some(owner_reference(cluster)?),
            client,
            ceph,
            cluster: cluster.clone(),
        })
    }

    /// Runs the mgr daemons and configures their modules. Module failures are logged and do not
    /// fail the reconcile.
    #[instrument(skip(self, info), fields(namespace = %self.namespace))]
    pub async fn start(&self, info: &ClusterInfo) -> Result<()> {
        let spec = &self.cluster.spec;
        validate_modules(&spec.mgr.modules)?;

        let ids = daemon_ids(spec.mgr.count);
        for id in &ids {
            if self.ceph.cancel_token().is_cancelled() {
                return Err(Error::StdError(StdError::Cancelled));
            }
            self.ensure_keyring(id).await?;
            self.start_mgr(info, id).await?;
        }
        self.remove_extra_mgrs(&ids).await?;

        self.reconcile_services().await?;
        self.configure_modules(info).await;
        Ok(())
    }

    async fn ensure_keyring(&self, id: &str) -> Result<()> {
        let entity = format!("mgr.{id}");
        let key = self.ceph.auth_get_or_create_key(&entity, &MGR_CAPS).await?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let desired = mgr_keyring_secret(&self.namespace, id, &key, self.owner.as_ref());
        create_or_update(&secrets, &desired, |have, want| have.data != want.data)
            .await
            .with_context(|| format!("failed to save keyring for mgr {id}"))?;
        Ok(())
    }

    async fn start_mgr(&self, info: &ClusterInfo, id: &str) -> Result<()> {
        let spec = &self.cluster.spec;
        let placement = spec.placement.mgr_placement();
        let params = MgrSpecParams {
            namespace: &self.namespace,
            image: &spec.ceph_version.image,
            data_dir_host_path: &spec.data_dir_host_path,
            host_network: spec.network.host_network,
            placement: &placement,
            fsid: &info.fsid,
            mon_host: info.mon_host(),
            dashboard_port: spec.dashboard.enabled.then(|| dashboard::dashboard_port(&spec.dashboard)),
        };
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        create_or_update(&deployments, &mgr_deployment(&params, id, self.owner.as_ref()), deployment_needs_update)
            .await
            .with_context(|| format!("failed to start mgr {id}"))?;
        Ok(())
    }

    /// Drops mgr daemons beyond the desired count
    async fn remove_extra_mgrs(&self, ids: &[String]) -> Result<()> {
        let keep: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let existing = deployments
            .list(&ListParams::default().labels(&format!("app={MGR_APP}")))
            .await
            .context("failed to list mgr deployments")?;
        for deployment in existing {
            let Some(id) = deployment.labels().get(DAEMON_ID_LABEL).cloned() else {
                continue;
            };
            if keep.contains(id.as_str()) {
                continue;
            }
            info!("removing extra mgr {}", id);
            delete_if_exists(&deployments, &deployment.name_any(), &DeleteParams::default()).await?;
            delete_if_exists(&secrets, &keyring_secret_name(&id), &DeleteParams::default()).await?;
            if let Err(e) = self.ceph.auth_delete(&format!("mgr.{id}")).await {
                warn!("failed to delete the key of mgr {}: {}", id, e);
            }
        }
        Ok(())
    }

    async fn reconcile_services(&self) -> Result<()> {
        let mgr_map = self.ceph.mgr_dump().await?;
        if mgr_map.active_name.is_empty() {
            return Err(Error::requeue(
                StdError::MetadataMissing("no mgr is active yet".to_string()),
                TRANSIENT_REQUEUE,
            ));
        }

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let metrics = metrics_service(&self.namespace, &mgr_map.active_name, self.owner.as_ref());
        create_or_update(&services, &metrics, service_needs_update)
            .await
            .context("failed to reconcile the mgr metrics service")?;

        let spec = &self.cluster.spec.dashboard;
        if spec.enabled {
            let desired = dashboard::dashboard_service(&self.namespace, spec, self.owner.as_ref());
            create_or_update(&services, &desired, service_needs_update)
                .await
                .context("failed to reconcile the dashboard service")?;
        } else {
            delete_if_exists(&services, dashboard::DASHBOARD_SERVICE, &DeleteParams::default()).await?;
        }
        Ok(())
    }

    async fn configure_modules(&self, info: &ClusterInfo) {
        if let Err(e) = orchestrator::enable_module(&self.ceph, PROMETHEUS_MODULE, true).await {
            error!("failed to enable the prometheus module: {}", e);
        }
        if let Err(e) = orchestrator::configure(&self.ceph).await {
            error!("failed to configure the orchestrator module: {}", e);
        }

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(e) = dashboard::configure(
            &self.ceph,
            &secrets,
            &self.cluster.spec.dashboard,
            self.owner.as_ref(),
            info.ceph_version,
        )
        .await
        {
            error!("failed to configure the dashboard: {}", e);
        }

        for module in &self.cluster.spec.mgr.modules {
            let res = if module.enabled {
                orchestrator::enable_module(&self.ceph, &module.name, false).await
            } else {
                self.ceph.mgr_disable_module(&module.name).await
            };
            match res {
                Ok(()) => info!("mgr module {} enabled={}", module.name, module.enabled),
                Err(e) => error!("failed to configure mgr module {}: {}", module.name, e),
            }
        }
    }
}
