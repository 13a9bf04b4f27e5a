//! Coordinates node drains with OSD placement: at most one failure domain at a time loses the
//! disruption budgets that block evicting its OSDs.

pub mod canary;
pub mod crush_cache;
pub mod drain;
pub mod pdb;
pub mod state;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher::Config,
    },
    Client, ResourceExt,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};
use tokio::time::Duration;
use tracing::*;

use self::{
    canary::{canary_info, list_canaries, reconcile_canaries, OsdNode, CANARY_APP, TOPOLOGY_LABEL_PREFIX},
    drain::{min_failure_domain, plan_drain, DrainInput, DrainPlan, OsdInfo},
    pdb::{existing_osd_pdbs, ensure_osd_pdb, osd_pdb_name, reconcile_mgr_pdb, reconcile_mon_pdb, PdbClient, OSD_ID_LABEL},
    state::PdbState,
};
use crate::{
    api::v1::{
        cephcluster::CephCluster,
        pools::{CephBlockPool, CephFilesystem, CephObjectStore},
    },
    ceph::CephClient,
    controllers::context::{Context, State},
    placement::HOSTNAME_LABEL,
    util::{
        errors::{Error, Result, ResultExt},
        k8s::{namespace_of, owner_reference},
        telemetry,
    },
};

pub const OSD_APP: &str = "rook-ceph-osd";
const CONTROLLER: &str = "disruption";
const ACTIVE_REQUEUE: Duration = Duration::from_secs(30);
const IDLE_REQUEUE: Duration = Duration::from_secs(5 * 60);

/// Latest `CephCluster` per namespace, shared by the watches that map child events back to a
/// cluster
#[derive(Clone, Default)]
pub struct ClusterMap {
    clusters: Arc<Mutex<HashMap<String, CephCluster>>>,
}

impl ClusterMap {
    pub fn update(&self, cluster: &CephCluster) {
        if let Some(ns) = cluster.namespace() {
            let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
            clusters.insert(ns, cluster.clone());
        }
    }

    pub fn get(&self, namespace: &str) -> Option<CephCluster> {
        let clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        clusters.get(namespace).cloned()
    }

    pub fn namespaces(&self) -> Vec<String> {
        let clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        let mut namespaces: Vec<String> = clusters.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    pub fn remove(&self, namespace: &str) -> Option<CephCluster> {
        let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        clusters.remove(namespace)
    }

    /// The cluster an object in `namespace` belongs to, for watch mappers
    pub fn cluster_ref(&self, namespace: Option<String>) -> Option<ObjectRef<CephCluster>> {
        self.get(&namespace?).map(|c| ObjectRef::from_obj(&c))
    }
}

/// The narrowest failure domain over every pool of the namespace
pub async fn pool_failure_domain(client: &Client, namespace: &str) -> Result<String> {
    let lp = ListParams::default();
    let block: Api<CephBlockPool> = Api::namespaced(client.clone(), namespace);
    let fs: Api<CephFilesystem> = Api::namespaced(client.clone(), namespace);
    let object: Api<CephObjectStore> = Api::namespaced(client.clone(), namespace);

    let block = block.list(&lp).await.context("failed to list block pools")?;
    let fs = fs.list(&lp).await.context("failed to list filesystems")?;
    let object = object.list(&lp).await.context("failed to list object stores")?;

    let mut domains: Vec<String> = block.iter().map(|p| p.spec.pool.failure_domain.clone()).collect();
    for f in &fs {
        domains.push(f.spec.metadata_pool.failure_domain.clone());
        domains.extend(f.spec.data_pools.iter().map(|p| p.failure_domain.clone()));
    }
    for o in &object {
        domains.push(o.spec.metadata_pool.failure_domain.clone());
        domains.push(o.spec.data_pool.failure_domain.clone());
    }
    Ok(min_failure_domain(domains.iter().map(String::as_str)))
}

fn osd_id(deployment: &Deployment) -> Option<i32> {
    deployment.labels().get(OSD_ID_LABEL)?.parse().ok()
}

fn osd_node(deployment: &Deployment) -> Option<String> {
    let pod = deployment.spec.as_ref()?.template.spec.as_ref()?;
    pod.node_selector
        .as_ref()
        .and_then(|s| s.get(HOSTNAME_LABEL))
        .or_else(|| deployment.labels().get(&format!("{TOPOLOGY_LABEL_PREFIX}host")))
        .cloned()
}

fn topology_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .labels()
        .iter()
        .filter(|(k, _)| k.starts_with(TOPOLOGY_LABEL_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Bucket of `level` the OSD sits in: the topology label, else the crush location
async fn osd_domain(ctx: &Context, ceph: &CephClient, namespace: &str, deployment: &Deployment, id: i32, level: &str) -> Option<String> {
    if level == "osd" {
        return Some(format!("osd.{id}"));
    }
    if let Some(domain) = deployment.labels().get(&format!("{TOPOLOGY_LABEL_PREFIX}{level}")) {
        return Some(domain.clone());
    }
    match ctx.crush_cache.location(ceph, namespace, id, Utc::now()).await {
        Ok(location) => location.get(level).cloned(),
        Err(e) => {
            warn!("failed to look up the crush location of osd.{}: {}", id, e);
            None
        }
    }
}

fn timeout_minutes(spec_minutes: u64, default: Duration) -> chrono::Duration {
    let std = if spec_minutes > 0 {
        Duration::from_secs(spec_minutes * 60)
    } else {
        default
    };
    chrono::Duration::from_std(std).unwrap_or_else(|_| chrono::Duration::minutes(30))
}

async fn apply_plan(pdbs: &PdbClient, ceph: &CephClient, deployments: &Api<Deployment>, plan: &DrainPlan) -> Result<()> {
    for id in &plan.protected_osds {
        ensure_osd_pdb(pdbs, *id).await?;
    }
    // budgets of the chosen domain and of OSDs that are gone
    for id in existing_osd_pdbs(pdbs).await? {
        if !plan.protected_osds.contains(&id) {
            pdbs.delete(&osd_pdb_name(id)).await?;
        }
    }
    for domain in &plan.set_noout {
        ceph.osd_set_noout(domain).await?;
    }
    for domain in &plan.unset_noout {
        ceph.osd_unset_noout(domain).await?;
    }
    for name in &plan.delete_canaries {
        info!("deleting stale drain canary {}", name);
        crate::util::k8s::delete_if_exists(deployments, name, &Default::default()).await?;
    }
    Ok(())
}

#[instrument(skip(ctx, cluster), fields(trace_id))]
pub async fn reconcile(cluster: Arc<CephCluster>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.record_event(CONTROLLER).await;

    let ns = namespace_of(cluster.as_ref())?;
    if cluster.metadata.deletion_timestamp.is_some() {
        ctx.clusters.remove(&ns);
        ctx.crush_cache.forget_cluster(&ns).await;
        return Ok(Action::await_change());
    }
    ctx.clusters.update(&cluster);
    if cluster.is_external() {
        return Ok(Action::await_change());
    }

    let client = ctx.client.clone();
    let manage = cluster.spec.disruption_management.manage_pod_budgets;
    let owner = Some(owner_reference(cluster.as_ref())?);
    let pdbs = PdbClient::detect(client.clone(), &ns, owner.clone()).await?;
    reconcile_mgr_pdb(&pdbs, manage).await?;
    reconcile_mon_pdb(&pdbs, manage, cluster.spec.mon.count).await?;
    if !manage {
        debug!("pod disruption budgets are not managed for cluster {}", ns);
        return Ok(Action::requeue(IDLE_REQUEUE));
    }

    let ceph = ctx.ceph_client(&ns);
    let level = pool_failure_domain(&client, &ns).await?;
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &ns);
    let osd_deployments = deployments
        .list(&ListParams::default().labels(&format!("app={OSD_APP}")))
        .await
        .context("failed to list osd deployments")?
        .items;

    let mut osds = Vec::new();
    let mut osd_nodes: BTreeMap<String, OsdNode> = BTreeMap::new();
    for deployment in &osd_deployments {
        let Some(id) = osd_id(deployment) else {
            warn!("osd deployment {} has no {} label", deployment.name_any(), OSD_ID_LABEL);
            continue;
        };
        let node = osd_node(deployment);
        if let Some(node) = &node {
            let entry = osd_nodes.entry(node.clone()).or_insert_with(|| OsdNode {
                hostname: node.clone(),
                topology: topology_labels(deployment),
                tolerations: Vec::new(),
            });
            let tolerations = deployment
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|p| p.tolerations.clone())
                .unwrap_or_default();
            entry.add_tolerations(&tolerations);
        }
        osds.push(OsdInfo {
            id,
            node,
            domain: osd_domain(&ctx, &ceph, &ns, deployment, id, &level).await,
            ready: canary::is_ready(deployment),
        });
    }

    let existing_canaries = list_canaries(&deployments).await?;
    reconcile_canaries(&deployments, &osd_nodes, &existing_canaries, &cluster.spec.ceph_version.image, owner).await?;
    let canaries = existing_canaries.iter().filter_map(|d| canary_info(d, &level)).collect();

    let (pgs_clean, pg_message) = ceph.status().await?.pgs_clean();
    debug!("{}", pg_message);

    let previous = PdbState::load(&client, &ns).await?;
    let disruption = &cluster.spec.disruption_management;
    let plan = plan_drain(DrainInput {
        osds,
        canaries,
        pgs_clean,
        state: previous.clone(),
        now: Utc::now(),
        pg_health_check_timeout: timeout_minutes(disruption.pg_health_check_timeout, ctx.config.pg_health_check_timeout),
        osd_maintenance_timeout: timeout_minutes(disruption.osd_maintenance_timeout, ctx.config.osd_maintenance_timeout),
    });
    if plan.state.chosen != previous.chosen {
        match &plan.state.chosen {
            Some(domain) => info!("allowing drains in {} {} of cluster {}", level, domain, ns),
            None => info!("all failure domains of cluster {} are protected again", ns),
        }
    }

    apply_plan(&pdbs, &ceph, &deployments, &plan).await?;
    if plan.state != previous {
        plan.state.save(&client, &ns).await?;
    }

    if plan.state.chosen.is_some() {
        Ok(Action::requeue(ACTIVE_REQUEUE))
    } else {
        Ok(Action::requeue(IDLE_REQUEUE))
    }
}

fn error_policy(cluster: Arc<CephCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("disruption reconcile of {} failed: {:?}", cluster.name_any(), error);
    ctx.metrics.reconcile_failure(cluster.as_ref(), error);
    Action::requeue(error.requeue_after().unwrap_or(ACTIVE_REQUEUE))
}

/// Watches clusters, OSD and canary deployments and pools
pub async fn run(state: State, client: Client) {
    let ctx = state.to_context(client.clone());
    let clusters = Api::<CephCluster>::all(client.clone());
    let pod_selector = format!("app in ({OSD_APP},{CANARY_APP})");

    let deployment_map = ctx.clusters.clone();
    let block_map = ctx.clusters.clone();
    let fs_map = ctx.clusters.clone();
    let object_map = ctx.clusters.clone();

    Controller::new(clusters, Config::default().any_semantic())
        .watches(
            Api::<Deployment>::all(client.clone()),
            Config::default().labels(&pod_selector),
            move |d| deployment_map.cluster_ref(d.namespace()),
        )
        .watches(Api::<CephBlockPool>::all(client.clone()), Config::default(), move |p| {
            block_map.cluster_ref(p.namespace())
        })
        .watches(Api::<CephFilesystem>::all(client.clone()), Config::default(), move |f| {
            fs_map.cluster_ref(f.namespace())
        })
        .watches(Api::<CephObjectStore>::all(client.clone()), Config::default(), move |o| {
            object_map.cluster_ref(o.namespace())
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::v1::cephcluster::CephClusterSpec,
        ceph::testing::MockExecutor,
        controllers::context::testing,
        tests::mock_client,
    };
    use http::Method;
    use serde_json::json;

    fn cluster(ns: &str) -> CephCluster {
        let mut c = CephCluster::new("rook-ceph", CephClusterSpec::default());
        c.metadata.namespace = Some(ns.to_string());
        c.metadata.uid = Some("uid-1".to_string());
        c
    }

    #[test]
    fn cluster_map_maps_namespaces_to_clusters() {
        let map = ClusterMap::default();
        map.update(&cluster("b"));
        map.update(&cluster("a"));
        assert_eq!(map.namespaces(), vec!["a", "b"]);
        let reference = map.cluster_ref(Some("a".into())).unwrap();
        assert_eq!(reference.name, "rook-ceph");
        assert_eq!(reference.namespace.as_deref(), Some("a"));
        assert!(map.cluster_ref(Some("c".into())).is_none());
        assert!(map.cluster_ref(None).is_none());
        map.remove("a");
        assert!(map.get("a").is_none());
    }

    #[test]
    fn spec_timeouts_override_the_operator_default() {
        assert_eq!(timeout_minutes(0, Duration::from_secs(600)), chrono::Duration::minutes(10));
        assert_eq!(timeout_minutes(45, Duration::from_secs(600)), chrono::Duration::minutes(45));
    }

    #[test]
    fn osd_deployment_fields() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": {"name": "rook-ceph-osd-4", "labels": {
                "app": "rook-ceph-osd", "ceph-osd-id": "4", "topology-location-zone": "z1"
            }},
            "spec": {
                "selector": {},
                "template": {"spec": {
                    "containers": [],
                    "nodeSelector": {"kubernetes.io/hostname": "node-a"}
                }}
            }
        }))
        .unwrap();
        assert_eq!(osd_id(&deployment), Some(4));
        assert_eq!(osd_node(&deployment).as_deref(), Some("node-a"));
        assert_eq!(topology_labels(&deployment).len(), 1);
    }

    #[tokio::test]
    async fn pool_failure_domain_is_the_narrowest_over_all_pools() {
        let (client, mut server) = mock_client();
        let task = tokio::spawn(async move { pool_failure_domain(&client, "rook-ceph").await.unwrap() });
        let base = "/apis/ceph.rook.io/v1/namespaces/rook-ceph";
        server
            .expect(
                Method::GET,
                &format!("{base}/cephblockpools"),
                200,
                json!({"apiVersion": "ceph.rook.io/v1", "kind": "CephBlockPoolList", "metadata": {}, "items": [
                    {"apiVersion": "ceph.rook.io/v1", "kind": "CephBlockPool",
                     "metadata": {"name": "replicapool", "namespace": "rook-ceph"},
                     "spec": {"failureDomain": "zone"}}
                ]}),
            )
            .await;
        server
            .expect(
                Method::GET,
                &format!("{base}/cephfilesystems"),
                200,
                json!({"apiVersion": "ceph.rook.io/v1", "kind": "CephFilesystemList", "metadata": {}, "items": [
                    {"apiVersion": "ceph.rook.io/v1", "kind": "CephFilesystem",
                     "metadata": {"name": "fs", "namespace": "rook-ceph"},
                     "spec": {"metadataPool": {"failureDomain": "zone"}, "dataPools": [{"failureDomain": "rack"}]}}
                ]}),
            )
            .await;
        server
            .expect(
                Method::GET,
                &format!("{base}/cephobjectstores"),
                200,
                json!({"apiVersion": "ceph.rook.io/v1", "kind": "CephObjectStoreList", "metadata": {}, "items": []}),
            )
            .await;
        assert_eq!(task.await.unwrap(), "rack");
    }

    #[tokio::test]
    async fn deleted_clusters_are_forgotten() {
        let (client, _server) = mock_client();
        let ctx = testing::context(client, &MockExecutor::new());
        let mut deleted = cluster("rook-ceph");
        ctx.clusters.update(&deleted);
        deleted.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()));
        let action = reconcile(Arc::new(deleted), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.clusters.get("rook-ceph").is_none());
    }
}
