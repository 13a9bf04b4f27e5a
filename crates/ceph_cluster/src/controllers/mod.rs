pub mod bucket_topic;
pub mod cluster_controller;
pub mod context;
pub mod disruption;
pub mod lua_script;
pub mod mgr;
pub mod mon;
pub mod object_realm;

use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, finalizer},
    Client, Resource,
};

use self::context::Context;
use crate::{
    api::v1::cephcluster::CephCluster,
    reporting::{object_key, Phase, Reported},
    util::errors::{Error, Result, ResultExt, StdError},
};

/// Unwraps reconciler failures from the finalizer wrapper so their kind survives
pub(crate) fn finalizer_error(e: finalizer::Error<Error>) -> Error {
    match e {
        finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
        other => Error::StdError(StdError::FinalizerError(Box::new(other))),
    }
}

/// The live `CephCluster` of `namespace`, if any
pub(crate) async fn find_cluster(client: &Client, namespace: &str) -> Result<Option<CephCluster>> {
    let clusters: Api<CephCluster> = Api::namespaced(client.clone(), namespace);
    let list = clusters
        .list(&ListParams::default())
        .await
        .context("failed to list ceph clusters")?;
    Ok(list.items.into_iter().find(|c| c.metadata.deletion_timestamp.is_none()))
}

/// Object controllers wait for a cluster in their namespace
pub(crate) async fn require_cluster(client: &Client, namespace: &str) -> Result<CephCluster> {
    find_cluster(client, namespace).await?.ok_or_else(|| {
        Error::dependency(
            format!("CephCluster in {namespace}"),
            "no ceph cluster exists in the namespace",
        )
    })
}

/// Reports a reconcile unless it just finished deleting the object
pub(crate) async fn finish<K: Reported + Resource<Scope = kube::core::NamespaceResourceScope>>(ctx: &Context, obj: &K, result: Result<Action>, phase: Phase) -> Result<Action> {
    if obj.meta().deletion_timestamp.is_some() && result.is_ok() {
        ctx.events.forget(&object_key(&obj.object_ref(&())));
        return result;
    }
    ctx.report(obj, result, phase).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::v1::cephcluster::CephClusterSpec, ceph::testing::MockExecutor, controllers::mon::tests::ceph_cluster,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[tokio::test]
    async fn finished_deletions_drop_their_events() {
        let (client, _server) = crate::tests::mock_client();
        let ctx = context::testing::context(client, &MockExecutor::new());
        let mut cluster = ceph_cluster(CephClusterSpec::default());
        let key = object_key(&cluster.object_ref(&()));
        assert!(ctx.events.should_emit(&key, "DependencyMissing"));

        cluster.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        finish(&ctx, &cluster, Ok(Action::await_change()), Phase::Ready)
            .await
            .unwrap();
        assert!(ctx.events.is_empty());
    }
}
