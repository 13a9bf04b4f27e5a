//! Multisite realms and zone groups

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Client, ResourceExt,
};
use std::sync::Arc;
use tracing::*;

use crate::{
    api::v1::object::{CephObjectRealm, CephObjectZoneGroup},
    ceph::{command::ENOENT, CephClient},
    controllers::{
        context::{Context, State},
        require_cluster,
    },
    reporting::Phase,
    util::{
        errors::{Error, Result, ResultExt, StdError, TRANSIENT_REQUEUE},
        k8s::{get_opt, namespace_of},
        telemetry,
    },
};

const REALM_CONTROLLER: &str = "objectrealm";
const ZONE_GROUP_CONTROLLER: &str = "objectzonegroup";

pub const ACCESS_KEY: &str = "access-key";
pub const SECRET_KEY: &str = "secret-key";

async fn rgw_admin(ceph: &CephClient, args: &[&str]) -> Result<String> {
    let out = ceph
        .run_radosgw_admin(args)
        .await
        .map_err(|e| Error::StdError(StdError::CommandError(e)))?;
    Ok(out.stdout)
}

/// `<verb> get`, then `<verb> create` when the object does not exist
async fn get_or_create(ceph: &CephClient, verb: &str, get: &[String], create: &[String]) -> Result<()> {
    let mut args = vec![verb, "get"];
    args.extend(get.iter().map(String::as_str));
    match rgw_admin(ceph, &args).await {
        Ok(_) => {
            debug!("{} {} exists", verb, get.join(" "));
            return Ok(());
        }
        Err(e) if e.exit_code() == Some(ENOENT) => {}
        Err(e) => return Err(e).with_context(|| format!("failed to get {verb}")),
    }
    let mut args = vec![verb, "create"];
    args.extend(create.iter().map(String::as_str));
    rgw_admin(ceph, &args)
        .await
        .with_context(|| format!("failed to create {verb}"))?;
    info!("created {} {}", verb, create.join(" "));
    Ok(())
}

async fn realm_keys(client: &Client, realm: &CephObjectRealm) -> Result<(String, String)> {
    let ns = namespace_of(realm)?;
    let name = realm.keys_secret_name();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &ns);
    let secret = get_opt(&secrets, &name)
        .await
        .context("failed to get realm keys")?
        .ok_or_else(|| Error::dependency(format!("Secret {ns}/{name}"), "realm keys secret does not exist"))?;
    let key = |k: &str| {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(k))
            .map(|v| String::from_utf8_lossy(&v.0).trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Invalid(format!("secret {name} has no '{k}'")))
    };
    Ok((key(ACCESS_KEY)?, key(SECRET_KEY)?))
}

/// Pulls the realm from its peer when an endpoint is given, creates it locally otherwise
pub async fn ensure_realm(client: &Client, ceph: &CephClient, realm: &CephObjectRealm) -> Result<()> {
    let name = realm.name_any();
    let realm_arg = format!("--rgw-realm={name}");
    match realm.spec.pull.as_ref().filter(|p| !p.endpoint.is_empty()) {
        Some(pull) => {
            reqwest::Url::parse(&pull.endpoint)
                .map_err(|e| Error::Invalid(format!("pull endpoint {:?} is not a valid URL: {e}", pull.endpoint)))?;
            let (access_key, secret_key) = realm_keys(client, realm).await?;
            let url = format!("--url={}", pull.endpoint);
            let access = format!("--access-key={access_key}");
            let secret = format!("--secret-key={secret_key}");
            rgw_admin(ceph, &["realm", "pull", &realm_arg, &url, &access, &secret])
                .await
                .with_context(|| format!("failed to pull realm {name} from {}", pull.endpoint))?;
            info!("pulled realm {} from {}", name, pull.endpoint);
        }
        None => get_or_create(ceph, "realm", &[realm_arg.clone()], &[realm_arg]).await?,
    }
    Ok(())
}

/// Creates the zone group in its realm; the realm resource must exist
pub async fn ensure_zone_group(client: &Client, ceph: &CephClient, group: &CephObjectZoneGroup) -> Result<()> {
    let ns = namespace_of(group)?;
    let realm = &group.spec.realm;
    if realm.is_empty() {
        return Err(Error::Invalid("missing realm".to_string()));
    }
    let realms: Api<CephObjectRealm> = Api::namespaced(client.clone(), &ns);
    if get_opt(&realms, realm).await?.is_none() {
        return Err(Error::dependency(
            format!("CephObjectRealm {ns}/{realm}"),
            "realm does not exist",
        ));
    }
    let args = [
        format!("--rgw-realm={realm}"),
        format!("--rgw-zonegroup={}", group.name_any()),
    ];
    get_or_create(ceph, "zonegroup", &args, &args).await
}

#[instrument(skip(ctx, realm), fields(trace_id))]
pub async fn reconcile_realm(realm: Arc<CephObjectRealm>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(REALM_CONTROLLER);
    ctx.record_event(REALM_CONTROLLER).await;

    if realm.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let ns = namespace_of(realm.as_ref())?;
    info!("Reconciling CephObjectRealm \"{}\" in {}", realm.name_any(), ns);
    let result = async {
        require_cluster(&ctx.client, &ns).await?;
        ensure_realm(&ctx.client, &ctx.ceph_client(&ns), &realm).await?;
        Ok(Action::await_change())
    }
    .await;
    ctx.report(realm.as_ref(), result, Phase::Ready).await
}

#[instrument(skip(ctx, group), fields(trace_id))]
pub async fn reconcile_zone_group(group: Arc<CephObjectZoneGroup>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(ZONE_GROUP_CONTROLLER);
    ctx.record_event(ZONE_GROUP_CONTROLLER).await;

    if group.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let ns = namespace_of(group.as_ref())?;
    info!("Reconciling CephObjectZoneGroup \"{}\" in {}", group.name_any(), ns);
    let result = async {
        require_cluster(&ctx.client, &ns).await?;
        ensure_zone_group(&ctx.client, &ctx.ceph_client(&ns), &group).await?;
        Ok(Action::await_change())
    }
    .await;
    ctx.report(group.as_ref(), result, Phase::Ready).await
}

fn realm_error_policy(realm: Arc<CephObjectRealm>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile of CephObjectRealm {} failed: {:?}", realm.name_any(), error);
    ctx.metrics.reconcile_failure(realm.as_ref(), error);
    Action::requeue(error.requeue_after().unwrap_or(TRANSIENT_REQUEUE))
}

fn zone_group_error_policy(group: Arc<CephObjectZoneGroup>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile of CephObjectZoneGroup {} failed: {:?}", group.name_any(), error);
    ctx.metrics.reconcile_failure(group.as_ref(), error);
    Action::requeue(error.requeue_after().unwrap_or(TRANSIENT_REQUEUE))
}

pub async fn run_realms(state: State, client: Client) {
    let realms = Api::<CephObjectRealm>::all(client.clone());
    Controller::new(realms, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_realm, realm_error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

pub async fn run_zone_groups(state: State, client: Client) {
    let groups = Api::<CephObjectZoneGroup>::all(client.clone());
    Controller::new(groups, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_zone_group, zone_group_error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::v1::object::{CephObjectRealmSpec, CephObjectZoneGroupSpec, PullSpec},
        ceph::testing::MockExecutor,
        tests::{mock_client, not_found},
        util::errors::ErrorKind,
    };
    use http::Method;
    use serde_json::json;

    fn realm(pull: Option<&str>) -> CephObjectRealm {
        let mut realm = CephObjectRealm::new(
            "east",
            CephObjectRealmSpec {
                pull: pull.map(|e| PullSpec { endpoint: e.to_string() }),
            },
        );
        realm.metadata.namespace = Some("rook-ceph".into());
        realm
    }

    fn zone_group() -> CephObjectZoneGroup {
        let mut group = CephObjectZoneGroup::new("us", CephObjectZoneGroupSpec { realm: "east".into() });
        group.metadata.namespace = Some("rook-ceph".into());
        group
    }

    #[tokio::test]
    async fn missing_realms_are_created() {
        let mock = MockExecutor::new();
        mock.on("radosgw-admin", "realm get", Err(MockExecutor::exit(ENOENT)));
        let (client, _server) = mock_client();
        ensure_realm(&client, &mock.client("rook-ceph"), &realm(None)).await.unwrap();
        assert_eq!(
            mock.commands(),
            vec![
                "radosgw-admin realm get --rgw-realm=east",
                "radosgw-admin realm create --rgw-realm=east",
            ]
        );
    }

    #[tokio::test]
    async fn existing_realms_are_left_alone() {
        let mock = MockExecutor::new();
        let (client, _server) = mock_client();
        ensure_realm(&client, &mock.client("rook-ceph"), &realm(None)).await.unwrap();
        assert_eq!(mock.commands(), vec!["radosgw-admin realm get --rgw-realm=east"]);
    }

    #[tokio::test]
    async fn realms_with_an_endpoint_are_pulled() {
        let mock = MockExecutor::new();
        let (client, mut server) = mock_client();
        let ceph = mock.client("rook-ceph");
        let api = tokio::spawn(async move {
            server
                .expect(
                    Method::GET,
                    "/api/v1/namespaces/rook-ceph/secrets/east-keys",
                    200,
                    json!({
                        "apiVersion": "v1", "kind": "Secret",
                        "metadata": {"name": "east-keys", "namespace": "rook-ceph"},
                        // AKID / s3cret
                        "data": {"access-key": "QUtJRA==", "secret-key": "czNjcmV0"}
                    }),
                )
                .await;
        });
        ensure_realm(&client, &ceph, &realm(Some("http://peer:80"))).await.unwrap();
        api.await.unwrap();
        assert_eq!(
            mock.commands(),
            vec![
                "radosgw-admin realm pull --rgw-realm=east --url=http://peer:80 \
                 --access-key=AKID --secret-key=s3cret"
            ]
        );
    }

    #[tokio::test]
    async fn pull_waits_for_the_keys() {
        let mock = MockExecutor::new();
        let (client, mut server) = mock_client();
        let ceph = mock.client("rook-ceph");
        let api = tokio::spawn(async move {
            server
                .expect(Method::GET, "/api/v1/namespaces/rook-ceph/secrets/east-keys", 404, not_found())
                .await;
        });
        let err = ensure_realm(&client, &ceph, &realm(Some("http://peer:80"))).await.unwrap_err();
        api.await.unwrap();
        assert_eq!(err.kind(), ErrorKind::DependencyMissing);
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn zone_groups_wait_for_their_realm() {
        let mock = MockExecutor::new();
        let (client, mut server) = mock_client();
        let ceph = mock.client("rook-ceph");
        let api = tokio::spawn(async move {
            server
                .expect(
                    Method::GET,
                    "/apis/ceph.rook.io/v1/namespaces/rook-ceph/cephobjectrealms/east",
                    404,
                    not_found(),
                )
                .await;
        });
        let err = ensure_zone_group(&client, &ceph, &zone_group()).await.unwrap_err();
        api.await.unwrap();
        assert_eq!(err.kind(), ErrorKind::DependencyMissing);
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn zone_groups_are_created_in_their_realm() {
        let mock = MockExecutor::new();
        mock.on("radosgw-admin", "zonegroup get", Err(MockExecutor::exit(ENOENT)));
        let (client, mut server) = mock_client();
        let ceph = mock.client("rook-ceph");
        let api = tokio::spawn(async move {
            server
                .expect(
                    Method::GET,
                    "/apis/ceph.rook.io/v1/namespaces/rook-ceph/cephobjectrealms/east",
                    200,
                    serde_json::to_value(realm(None)).unwrap(),
                )
                .await;
        });
        ensure_zone_group(&client, &ceph, &zone_group()).await.unwrap();
        api.await.unwrap();
        assert_eq!(
            mock.commands()[1],
            "radosgw-admin zonegroup create --rgw-realm=east --rgw-zonegroup=us"
        );
    }
}
