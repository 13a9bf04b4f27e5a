use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::policy::v1::PodDisruptionBudget,
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::util::{
    errors::{Result, ResultExt},
    k8s::{is_not_found, labels, FIELD_MANAGER, MANAGED_BY_LABEL},
};

pub const OSD_PDB_APP: &str = "rook-ceph-osd-pdb";
pub const OSD_ID_LABEL: &str = "ceph-osd-id";
pub const MON_PDB_NAME: &str = "rook-ceph-mon-pdb";
pub const MGR_PDB_NAME: &str = "rook-ceph-mgr-pdb";
/// Start of the mon failover that lowered the mon budget to 0
pub const MON_FAILOVER_ANNOTATION: &str = "ceph.rook.io/mon-failover-started";
/// A zero mon budget is reset once its failover is older than this
pub const MON_FAILOVER_TTL: chrono::Duration = chrono::Duration::minutes(10);
const MON_APP: &str = "rook-ceph-mon";
const MGR_APP: &str = "rook-ceph-mgr";

/// Policy API group version served for disruption budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdbVersion {
    V1,
    V1Beta1,
}

impl PdbVersion {
    /// policy/v1 from Kubernetes 1.21 on. Suffixes like `27+` are ignored and an unreadable
    /// minor counts as a current server.
    pub fn from_server_minor(minor: &str) -> Self {
        let digits: String = minor.trim().chars().take_while(char::is_ascii_digit).collect();
        match digits.parse::<u32>() {
            Ok(minor) if minor < 21 => PdbVersion::V1Beta1,
            _ => PdbVersion::V1,
        }
    }

    pub async fn detect(client: &Client) -> Result<Self> {
        let info = client
            .apiserver_version()
            .await
            .context("failed to query the API server version")?;
        let version = Self::from_server_minor(&info.minor);
        debug!("API server {}.{} serves {:?} disruption budgets", info.major, info.minor, version);
        Ok(version)
    }

    pub fn api_resource(&self) -> ApiResource {
        match self {
            PdbVersion::V1 => ApiResource::erase::<PodDisruptionBudget>(&()),
            PdbVersion::V1Beta1 => {
                ApiResource::from_gvk(&GroupVersionKind::gvk("policy", "v1beta1", "PodDisruptionBudget"))
            }
        }
    }
}

/// Disruption budgets of one namespace in whichever policy version the server speaks
#[derive(Clone)]
pub struct PdbClient {
    api: Api<DynamicObject>,
    resource: ApiResource,
    namespace: String,
    owner: Option<OwnerReference>,
}

impl PdbClient {
    pub fn new(client: Client, namespace: &str, version: PdbVersion, owner: Option<OwnerReference>) -> Self {
        let resource = version.api_resource();
        Self {
            api: Api::namespaced_with(client, namespace, &resource),
            resource,
            namespace: namespace.to_string(),
            owner,
        }
    }

    pub async fn detect(client: Client, namespace: &str, owner: Option<OwnerReference>) -> Result<Self> {
        let version = PdbVersion::detect(&client).await?;
        Ok(Self::new(client, namespace, version, owner))
    }

    pub fn budget(
        &self,
        name: &str,
        object_labels: BTreeMap<String, String>,
        selector: BTreeMap<String, String>,
        max_unavailable: i32,
    ) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &self.resource)
            .within(&self.namespace)
            .data(json!({
                "spec": {
                    "maxUnavailable": max_unavailable,
                    "selector": { "matchLabels": selector },
                }
            }));
        obj.metadata.labels = Some(object_labels);
        obj.metadata.owner_references = self.owner.clone().map(|o| vec![o]);
        obj
    }

    pub async fn get(&self, name: &str) -> Result<Option<DynamicObject>> {
        self.api
            .get_opt(name)
            .await
            .with_context(|| format!("failed to get disruption budget {name}"))
    }

    /// Server side applies `budget`
    pub async fn apply(&self, budget: &DynamicObject) -> Result<()> {
        let name = budget.name_any();
        self.api
            .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(budget))
            .await
            .with_context(|| format!("failed to apply disruption budget {name}"))?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("deleted disruption budget {}", name);
                Ok(true)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to delete disruption budget {name}")),
        }
    }

    pub async fn list(&self, selector: &str) -> Result<Vec<DynamicObject>> {
        Ok(self
            .api
            .list(&ListParams::default().labels(selector))
            .await
            .context("failed to list disruption budgets")?
            .items)
    }
}

pub fn max_unavailable_of(budget: &DynamicObject) -> Option<i64> {
    budget.data.pointer("/spec/maxUnavailable").and_then(|v| v.as_i64())
}

pub fn osd_pdb_name(osd_id: i32) -> String {
    format!("rook-ceph-osd-{osd_id}")
}

pub fn osd_pdb(pdbs: &PdbClient, osd_id: i32) -> DynamicObject {
    let id = osd_id.to_string();
    pdbs.budget(
        &osd_pdb_name(osd_id),
        labels(&[("app", OSD_PDB_APP), (MANAGED_BY_LABEL, FIELD_MANAGER)]),
        labels(&[(OSD_ID_LABEL, id.as_str())]),
        0,
    )
}

/// Blocks eviction of `osd_id` unless an identical budget is already there
pub async fn ensure_osd_pdb(pdbs: &PdbClient, osd_id: i32) -> Result<()> {
    if let Some(existing) = pdbs.get(&osd_pdb_name(osd_id)).await? {
        if max_unavailable_of(&existing) == Some(0) {
            return Ok(());
        }
    }
    info!("blocking drains of osd.{}", osd_id);
    pdbs.apply(&osd_pdb(pdbs, osd_id)).await
}

/// Osd ids of the blocking budgets that exist
pub async fn existing_osd_pdbs(pdbs: &PdbClient) -> Result<Vec<i32>> {
    let selector = format!("app={OSD_PDB_APP}");
    Ok(pdbs
        .list(&selector)
        .await?
        .iter()
        .filter_map(|b| b.name_any().strip_prefix("rook-ceph-osd-")?.parse().ok())
        .collect())
}

/// One mon down at a time for odd counts; even counts keep a majority with `count - 1` down
pub fn mon_max_unavailable(count: i32) -> i32 {
    if count % 2 == 1 {
        1
    } else {
        count - 1
    }
}

fn mon_pdb(pdbs: &PdbClient, max_unavailable: i32, failover_started: Option<DateTime<Utc>>) -> DynamicObject {
    let mut budget = pdbs.budget(
        MON_PDB_NAME,
        labels(&[("app", MON_APP), (MANAGED_BY_LABEL, FIELD_MANAGER)]),
        labels(&[("app", MON_APP)]),
        max_unavailable,
    );
    if let Some(started) = failover_started {
        budget.metadata.annotations = Some(labels(&[(MON_FAILOVER_ANNOTATION, started.to_rfc3339().as_str())]));
    }
    budget
}

/// Whether `budget` was lowered by a mon failover that may still be running at `now`
pub fn mon_failover_in_progress(budget: &DynamicObject, now: DateTime<Utc>) -> bool {
    if max_unavailable_of(budget) != Some(0) {
        return false;
    }
    budget
        .annotations()
        .get(MON_FAILOVER_ANNOTATION)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .is_some_and(|started| now.signed_duration_since(started) < MON_FAILOVER_TTL)
}

/// Keeps the mon budget in line with the mon count; no budget below three mons. A zero budget
/// is kept only while its failover is running.
pub async fn reconcile_mon_pdb(pdbs: &PdbClient, manage: bool, count: i32) -> Result<()> {
    if !manage || count <= 2 {
        pdbs.delete(MON_PDB_NAME).await?;
        return Ok(());
    }
    let desired = mon_max_unavailable(count);
    if let Some(existing) = pdbs.get(MON_PDB_NAME).await? {
        if mon_failover_in_progress(&existing, Utc::now()) {
            debug!("mon failover in progress, keeping the mon disruption budget at 0");
            return Ok(());
        }
        if max_unavailable_of(&existing) == Some(0) {
            info!("no mon failover is running, restoring the mon disruption budget to {}", desired);
        }
    }
    pdbs.apply(&mon_pdb(pdbs, desired, None)).await
}

async fn set_mon_budget(pdbs: &PdbClient, max_unavailable: i32, failover_started: Option<DateTime<Utc>>) -> Result<()> {
    if pdbs.get(MON_PDB_NAME).await?.is_none() {
        debug!("no mon disruption budget to adjust");
        return Ok(());
    }
    info!("setting mon disruption budget to {}", max_unavailable);
    pdbs.apply(&mon_pdb(pdbs, max_unavailable, failover_started)).await
}

/// Forbids mon evictions while a mon is being replaced
pub async fn block_mon_drain(pdbs: &PdbClient) -> Result<()> {
    set_mon_budget(pdbs, 0, Some(Utc::now())).await
}

pub async fn allow_mon_drain(pdbs: &PdbClient) -> Result<()> {
    set_mon_budget(pdbs, 1, None).await
}

pub async fn reconcile_mgr_pdb(pdbs: &PdbClient, manage: bool) -> Result<()> {
    if !manage {
        pdbs.delete(MGR_PDB_NAME).await?;
        return Ok(());
    }
    let desired = pdbs.budget(
        MGR_PDB_NAME,
        labels(&[("app", MGR_APP), (MANAGED_BY_LABEL, FIELD_MANAGER)]),
        labels(&[("app", MGR_APP)]),
        1,
    );
    if let Some(existing) = pdbs.get(MGR_PDB_NAME).await? {
        if max_unavailable_of(&existing) == Some(1) {
            return Ok(());
        }
    }
    pdbs.apply(&desired).await
}
