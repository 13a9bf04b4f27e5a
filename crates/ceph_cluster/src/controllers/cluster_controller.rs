use futures::StreamExt;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::ConfigMap};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as Finalizer},
        watcher::{self, Config},
    },
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use std::{fmt::Debug, sync::Arc};
use tokio::time::Duration;
use tracing::*;

use crate::{
    api::v1::{
        cephcluster::CephCluster,
        finalizer_name,
        luascript::CephLuaScript,
        notifications::CephBucketTopic,
        object::CephObjectRealm,
        pools::{CephBlockPool, CephFilesystem, CephObjectStore},
    },
    controllers::{
        context::{Context, State},
        finalizer_error, finish,
        mgr::MgrCluster,
        mon::MonCluster,
    },
    reporting::{report_phase, Phase},
    util::{
        errors::{Error, Result, ResultExt, TRANSIENT_REQUEUE},
        k8s::namespace_of,
        telemetry,
    },
};

const KIND: &str = "CephCluster";
const CONTROLLER: &str = "cephcluster";
/// Periodic resync once a cluster converged
const RESYNC: Duration = Duration::from_secs(5 * 60);

async fn list_names<K>(client: &Client, namespace: &str) -> Result<Vec<String>>
where
    K: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let list = api
        .list(&ListParams::default())
        .await
        .with_context(|| format!("failed to list {}", K::plural(&())))?;
    Ok(list
        .items
        .iter()
        .map(|o| format!("{} {}", K::kind(&()), o.name_any()))
        .collect())
}

/// Custom resources in `namespace` that still depend on the cluster
pub async fn dependents(client: &Client, namespace: &str) -> Result<Vec<String>> {
    let mut blockers = Vec::new();
    blockers.extend(list_names::<CephBlockPool>(client, namespace).await?);
    blockers.extend(list_names::<CephFilesystem>(client, namespace).await?);
    blockers.extend(list_names::<CephObjectStore>(client, namespace).await?);
    blockers.extend(list_names::<CephObjectRealm>(client, namespace).await?);
    blockers.extend(list_names::<CephBucketTopic>(client, namespace).await?);
    blockers.extend(list_names::<CephLuaScript>(client, namespace).await?);
    Ok(blockers)
}

async fn apply(cluster: &CephCluster, ctx: Arc<Context>) -> Result<Action> {
    let ns = namespace_of(cluster)?;
    ctx.clusters.update(cluster);

    let ceph = ctx.ceph_client(&ns);
    let guard = ctx.locks.acquire(&ns).await;
    let mut mons = MonCluster::load(ctx.client.clone(), ceph.clone(), cluster).await?;
    if cluster.is_external() {
        info!("connecting to external cluster {} ({})", ns, mons.info.fsid);
        mons.store().write_connection_config(&mons.info, &ceph).await?;
    } else {
        mons.start().await?;
        MgrCluster::new(ctx.client.clone(), ceph, cluster)?
            .start(&mons.info)
            .await?;
    }
    drop(guard);

    if ctx.health_checkers.start_once(ctx.clone(), &ns) {
        debug!("health checker of cluster {} started", ns);
    }
    Ok(Action::requeue(RESYNC))
}

async fn cleanup(cluster: &CephCluster, ctx: Arc<Context>) -> Result<Action> {
    let ns = namespace_of(cluster)?;
    let api: Api<CephCluster> = Api::namespaced(ctx.client.clone(), &ns);
    if let Err(e) = report_phase(&api, cluster, Phase::Deleting, ctx.config.status_update_retries).await {
        warn!("failed to mark cluster {} as deleting: {}", ns, e);
    }

    let blockers = dependents(&ctx.client, &ns).await?;
    if !blockers.is_empty() {
        return Err(Error::BlockedByDependents { blockers });
    }

    info!("cluster {} is being deleted, stopping its background work", ns);
    ctx.health_checkers.stop(&ns);
    ctx.cancel_cluster(&ns);
    ctx.locks.remove(&ns);
    ctx.clusters.remove(&ns);
    ctx.crush_cache.forget_cluster(&ns).await;
    Ok(Action::await_change())
}

#[instrument(skip(ctx, cluster), fields(trace_id))]
pub async fn reconcile(cluster: Arc<CephCluster>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.record_event(CONTROLLER).await;

    let ns = namespace_of(cluster.as_ref())?;
    let clusters: Api<CephCluster> = Api::namespaced(ctx.client.clone(), &ns);
    info!("Reconciling CephCluster \"{}\" in {}", cluster.name_any(), ns);
    let result = finalizer(&clusters, &finalizer_name(KIND), cluster.clone(), |event| async {
        match event {
            Finalizer::Apply(cluster) => apply(&cluster, ctx.clone()).await,
            Finalizer::Cleanup(cluster) => cleanup(&cluster, ctx.clone()).await,
        }
    })
    .await
    .map_err(finalizer_error);

    let phase = if cluster.is_external() {
        Phase::Connected
    } else {
        Phase::Ready
    };
    finish(&ctx, cluster.as_ref(), result, phase).await
}

fn error_policy(cluster: Arc<CephCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile of CephCluster {} failed: {:?}", cluster.name_any(), error);
    ctx.metrics.reconcile_failure(cluster.as_ref(), error);
    Action::requeue(error.requeue_after().unwrap_or(TRANSIENT_REQUEUE))
}

/// Fails when the cluster CRD is not installed
pub async fn check_crd(client: &Client) -> Result<()> {
    let clusters = Api::<CephCluster>::all(client.clone());
    clusters
        .list(&ListParams::default().limit(1))
        .await
        .context("CephCluster CRD is not queryable")?;
    Ok(())
}

pub async fn run(state: State, client: Client) {
    let clusters = Api::<CephCluster>::all(client.clone());
    let mon_selector = "app in (rook-ceph-mon,rook-ceph-mgr)";
    Controller::new(clusters, Config::default().any_semantic())
        .owns(
            Api::<Deployment>::all(client.clone()),
            watcher::Config::default().labels(mon_selector),
        )
        .owns(Api::<ConfigMap>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client))
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
        controllers::{context::testing, mon::tests::ceph_cluster},
        tests::{mock_client, ApiServer},
        util::errors::ErrorKind,
    };
    use http::Method;
    use serde_json::json;

    const GROUP: &str = "/apis/ceph.rook.io/v1/namespaces/rook-ceph";

    async fn expect_list(server: &mut ApiServer, plural: &str, kind: &str, names: &[&str]) {
        let items: Vec<_> = names
            .iter()
            .map(|n| {
                json!({
                    "apiVersion": "ceph.rook.io/v1", "kind": kind,
                    "metadata": {"name": n, "namespace": "rook-ceph"},
                    "spec": {}
                })
            })
            .collect();
        server
            .expect(
                Method::GET,
                &format!("{GROUP}/{plural}"),
                200,
                json!({"apiVersion": "ceph.rook.io/v1", "kind": format!("{kind}List"), "metadata": {}, "items": items}),
            )
            .await;
    }

    async fn expect_dependents(server: &mut ApiServer, pools: &[&str]) {
        expect_list(server, "cephblockpools", "CephBlockPool", pools).await;
        expect_list(server, "cephfilesystems", "CephFilesystem", &[]).await;
        expect_list(server, "cephobjectstores", "CephObjectStore", &[]).await;
        expect_list(server, "cephobjectrealms", "CephObjectRealm", &[]).await;
        expect_list(server, "cephbuckettopics", "CephBucketTopic", &[]).await;
        expect_list(server, "cephluascripts", "CephLuaScript", &[]).await;
    }

    fn deleting() -> CephCluster {
        let mut cluster = ceph_cluster(CephClusterSpec::default());
        cluster.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        cluster
    }

    #[tokio::test]
    async fn deletion_is_blocked_by_pools() {
        let (client, mut server) = mock_client();
        let ctx = testing::context(client, &MockExecutor::new());
        let cluster = deleting();
        let object = serde_json::to_value(&cluster).unwrap();
        let api = tokio::spawn(async move {
            let status = format!("{GROUP}/cephclusters/{}/status", "rook-ceph");
            server.expect(Method::GET, &status, 200, object.clone()).await;
            server.expect(Method::PATCH, &status, 200, object).await;
            expect_dependents(&mut server, &["replicapool"]).await;
        });
        let err = cleanup(&cluster, ctx.clone()).await.unwrap_err();
        api.await.unwrap();
        assert_eq!(err.kind(), ErrorKind::BlockedByDependents);
        assert!(err.to_string().contains("CephBlockPool replicapool"));
    }

    #[tokio::test]
    async fn deletion_cancels_background_work() {
        let (client, mut server) = mock_client();
        let ctx = testing::context(client, &MockExecutor::new());
        let cluster = deleting();
        ctx.clusters.update(&cluster);
        let token = ctx.cluster_token("rook-ceph");

        let object = serde_json::to_value(&cluster).unwrap();
        let api = tokio::spawn(async move {
            let status = format!("{GROUP}/cephclusters/{}/status", "rook-ceph");
            server.expect(Method::GET, &status, 200, object.clone()).await;
            server.expect(Method::PATCH, &status, 200, object).await;
            expect_dependents(&mut server, &[]).await;
        });
        cleanup(&cluster, ctx.clone()).await.unwrap();
        api.await.unwrap();
        assert!(token.is_cancelled());
        assert!(ctx.clusters.get("rook-ceph").is_none());
        assert!(!ctx.health_checkers.is_running("rook-ceph"));
    }
}
