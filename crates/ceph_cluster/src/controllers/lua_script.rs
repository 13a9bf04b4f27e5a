//! Gateway Lua scripts. A zone holds one script per context (and tenant), so every script the
//! operator writes starts with a marker line naming the `CephLuaScript` that owns it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config,
    },
    Client, ResourceExt,
};
use std::{path::PathBuf, str::FromStr, sync::Arc};
use tracing::*;
use xxhash_rust::xxh64::xxh64;

use crate::{
    api::v1::{
        finalizer_name,
        luascript::{CephLuaScript, CephLuaScriptSpec, LuaScriptContext},
        pools::{CephObjectStore, ZoneSpec},
    },
    ceph::{command::ENOENT, CephClient},
    controllers::{
        context::{Context, State},
        find_cluster, finalizer_error, finish, require_cluster,
    },
    reporting::{update_status, Phase},
    util::{
        errors::{Error, Result, ResultExt, StdError, TRANSIENT_REQUEUE},
        k8s::{get_opt, namespace_of},
        telemetry,
    },
};

const KIND: &str = "CephLuaScript";
const CONTROLLER: &str = "luascript";

/// Rejects specs that can never be applied
pub fn validate(script: &CephLuaScript) -> Result<()> {
    if script.metadata.name.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::Invalid("missing name".to_string()));
    }
    if script.metadata.namespace.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::Invalid("missing namespace".to_string()));
    }
    let spec = &script.spec;
    let set = |s: &Option<String>| s.as_deref().is_some_and(|s| !s.is_empty());
    let sources = [set(&spec.script), set(&spec.script_base64), set(&spec.script_url)]
        .iter()
        .filter(|s| **s)
        .count();
    match sources {
        0 => return Err(Error::Invalid("one of script, scriptBase64 or scriptURL must be provided".to_string())),
        1 => {}
        _ => return Err(Error::Invalid("only one of script, scriptBase64 or scriptURL may be provided".to_string())),
    }
    if let Some(url) = spec.script_url.as_deref().filter(|u| !u.is_empty()) {
        reqwest::Url::parse(url).map_err(|e| Error::Invalid(format!("scriptURL {url:?} is not a valid URL: {e}")))?;
    }
    if spec.context == LuaScriptContext::Background && !spec.tenant.is_empty() {
        return Err(Error::Invalid(
            "a tenant can't be specified for the background context".to_string(),
        ));
    }
    Ok(())
}

/// Source of the script, fetched when it comes from a URL
pub async fn script_body(spec: &CephLuaScriptSpec) -> Result<String> {
    if let Some(script) = spec.script.as_deref().filter(|s| !s.is_empty()) {
        return Ok(script.to_string());
    }
    if let Some(encoded) = spec.script_base64.as_deref().filter(|s| !s.is_empty()) {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Invalid(format!("scriptBase64 is not valid base64: {e}")))?;
        return Ok(String::from_utf8_lossy(&decoded).into_owned());
    }
    if let Some(url) = spec.script_url.as_deref().filter(|s| !s.is_empty()) {
        let response = reqwest::get(url)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::StdError(StdError::HttpError(format!("failed to fetch {url}: {e}"))))?;
        return response
            .text()
            .await
            .map_err(|e| Error::StdError(StdError::HttpError(format!("failed to read {url}: {e}"))));
    }
    Err(Error::Invalid("the script has no source".to_string()))
}

pub fn hash_script(body: &str) -> String {
    xxh64(body.as_bytes(), 0).to_string()
}

/// First line of a managed script: `-- <name>:<namespace>:<tenant>:<hash>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptMarker {
    pub name: String,
    pub namespace: String,
    pub tenant: String,
    pub hash: String,
}

impl ScriptMarker {
    pub fn for_script(script: &CephLuaScript, body: &str) -> Self {
        Self {
            name: script.name_any(),
            namespace: script.namespace().unwrap_or_default(),
            tenant: script.spec.tenant.clone(),
            hash: hash_script(body),
        }
    }

    pub fn owned_by(&self, script: &CephLuaScript) -> bool {
        self.name == script.name_any()
            && Some(&self.namespace) == script.metadata.namespace.as_ref()
            && self.tenant == script.spec.tenant
    }
}

impl std::fmt::Display for ScriptMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "-- {}:{}:{}:{}", self.name, self.namespace, self.tenant, self.hash)
    }
}

impl FromStr for ScriptMarker {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let malformed = |msg: String| Error::StdError(StdError::DecodingError(msg));
        let start = line
            .find("--")
            .ok_or_else(|| malformed("the script has no marker comment".to_string()))?;
        let rest = line[start..].trim_start_matches(['-', ' ']);
        if rest.is_empty() {
            return Err(malformed("the script marker comment is empty".to_string()));
        }
        let fields: Vec<&str> = rest.trim_end().split(':').collect();
        let [name, namespace, tenant, hash] = fields.as_slice() else {
            return Err(malformed(format!(
                "the script marker has {} fields instead of 4",
                fields.len()
            )));
        };
        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            tenant: tenant.to_string(),
            hash: hash.to_string(),
        })
    }
}

/// What to do with the script currently stored for the context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Write,
    UpToDate,
    /// Another `CephLuaScript` wrote it; only taken over once that one is gone
    OwnedBy(ScriptMarker),
}

/// `current` is the first line of the stored script
pub fn ownership(current: &str, script: &CephLuaScript, body: &str) -> Ownership {
    let Ok(marker) = current.parse::<ScriptMarker>() else {
        return Ownership::Write;
    };
    if !marker.owned_by(script) {
        return Ownership::OwnedBy(marker);
    }
    if marker.hash == hash_script(body) {
        Ownership::UpToDate
    } else {
        Ownership::Write
    }
}

/// `radosgw-admin script` for one zone, context and tenant
pub struct RgwScript<'a> {
    ceph: &'a CephClient,
    zone: String,
    context: LuaScriptContext,
    tenant: String,
}

impl<'a> RgwScript<'a> {
    pub fn new(ceph: &'a CephClient, zone: &str, spec: &CephLuaScriptSpec) -> Self {
        Self {
            ceph,
            zone: zone.to_string(),
            context: spec.context,
            tenant: spec.tenant.clone(),
        }
    }

    fn args(&self, verb: &str) -> Vec<String> {
        let mut args = vec![
            "script".to_string(),
            verb.to_string(),
            format!("--context={}", self.context),
            format!("--rgw-zone={}", self.zone),
        ];
        // background scripts are global to the zone
        if self.context != LuaScriptContext::Background {
            args.push(format!("--tenant={}", self.tenant));
        }
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self
            .ceph
            .run_radosgw_admin(&args)
            .await
            .with_context(|| format!("failed to run script {} in zone {}", args[1], self.zone))?;
        Ok(out.stdout)
    }

    /// Marker line of the stored script; empty when there is none
    pub async fn first_line(&self) -> Result<String> {
        match self.run(self.args("get")).await {
            Ok(out) => Ok(out.lines().next().unwrap_or_default().to_string()),
            Err(e) if e.exit_code() == Some(ENOENT) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn put(&self, path: &std::path::Path) -> Result<()> {
        let mut args = self.args("put");
        args.insert(4, format!("--infile={}", path.display()));
        self.run(args).await?;
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        self.run(self.args("rm")).await?;
        Ok(())
    }
}

fn script_path(ceph: &CephClient, script: &CephLuaScript) -> PathBuf {
    let dir = ceph
        .connection()
        .config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    dir.join(format!("{}-{}.lua", script.name_any(), script.uid().unwrap_or_default()))
}

async fn write_script(ceph: &CephClient, rgw: &RgwScript<'_>, script: &CephLuaScript, body: &str) -> Result<()> {
    let path = script_path(ceph, script);
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let contents = format!("{}\n{}", ScriptMarker::for_script(script, body), body);
    tokio::fs::write(&path, contents)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    rgw.put(&path).await?;
    info!("wrote {} script of {} to zone {}", rgw.context, script.name_any(), rgw.zone);
    Ok(())
}

async fn object_store(client: &Client, spec: &CephLuaScriptSpec) -> Result<Option<CephObjectStore>> {
    let stores: Api<CephObjectStore> = Api::namespaced(client.clone(), &spec.object_store_namespace);
    get_opt(&stores, &spec.object_store_name)
        .await
        .context("failed to get object store")
}

async fn apply(script: &CephLuaScript, ctx: &Context) -> Result<Action> {
    let client = ctx.client.clone();
    let ns = namespace_of(script)?;
    require_cluster(&client, &ns).await?;

    let spec = &script.spec;
    let store = object_store(&client, spec).await?.ok_or_else(|| {
        Error::dependency(
            format!("CephObjectStore {}/{}", spec.object_store_namespace, spec.object_store_name),
            "object store does not exist",
        )
    })?;
    let zone = store.zone_name();
    let body = script_body(spec).await?;

    let ceph = ctx.ceph_client(&ns);
    let rgw = RgwScript::new(&ceph, &zone, spec);
    match ownership(&rgw.first_line().await?, script, &body) {
        Ownership::UpToDate => debug!("{} script of zone {} is up to date", spec.context, zone),
        Ownership::Write => write_script(&ceph, &rgw, script, &body).await?,
        Ownership::OwnedBy(owner) => {
            let owners: Api<CephLuaScript> = Api::namespaced(client.clone(), &owner.namespace);
            if get_opt(&owners, &owner.name).await?.is_some() {
                return Err(Error::fatal(
                    "ScriptManagedElsewhere",
                    format!(
                        "the {} script of zone {} is managed by CephLuaScript {}/{}",
                        spec.context, zone, owner.namespace, owner.name
                    ),
                ));
            }
            info!("previous owner {}/{} is gone, taking over", owner.namespace, owner.name);
            write_script(&ceph, &rgw, script, &body).await?;
        }
    }

    let api: Api<CephLuaScript> = Api::namespaced(client, &ns);
    update_status(&api, &script.name_any(), ctx.config.status_update_retries, |status| {
        status.zone = Some(ZoneSpec { name: zone.clone() });
    })
    .await?;
    Ok(Action::await_change())
}

/// Removes the script from the gateway unless another `CephLuaScript` owns it
async fn cleanup(script: &CephLuaScript, ctx: &Context) -> Result<Action> {
    let client = ctx.client.clone();
    let ns = namespace_of(script)?;
    if find_cluster(&client, &ns).await?.is_none() {
        info!("cluster of {} is gone, nothing to remove", script.name_any());
        return Ok(Action::await_change());
    }

    let recorded = script
        .status
        .as_ref()
        .and_then(|s| s.zone.as_ref())
        .map(|z| z.name.clone())
        .filter(|z| !z.is_empty());
    let zone = match recorded {
        Some(zone) => zone,
        None => match object_store(&client, &script.spec).await? {
            Some(store) => store.zone_name(),
            None => return Ok(Action::await_change()),
        },
    };

    let ceph = ctx.ceph_client(&ns);
    let rgw = RgwScript::new(&ceph, &zone, &script.spec);
    match rgw.first_line().await?.parse::<ScriptMarker>() {
        Ok(marker) if !marker.owned_by(script) => {
            info!(
                "{} script of zone {} belongs to {}/{}, leaving it",
                script.spec.context, zone, marker.namespace, marker.name
            );
        }
        _ => rgw.remove().await?,
    }
    Ok(Action::await_change())
}

#[instrument(skip(ctx, script), fields(trace_id))]
pub async fn reconcile(script: Arc<CephLuaScript>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.record_event(CONTROLLER).await;

    if script.metadata.deletion_timestamp.is_none() {
        if let Err(e) = validate(&script) {
            return ctx.report(script.as_ref(), Err(e), Phase::Ready).await;
        }
    }

    let ns = namespace_of(script.as_ref())?;
    let scripts: Api<CephLuaScript> = Api::namespaced(ctx.client.clone(), &ns);
    info!("Reconciling CephLuaScript \"{}\" in {}", script.name_any(), ns);
    let result = finalizer(&scripts, &finalizer_name(KIND), script.clone(), |event| async {
        match event {
            Finalizer::Apply(script) => apply(&script, &ctx).await,
            Finalizer::Cleanup(script) => cleanup(&script, &ctx).await,
        }
    })
    .await
    .map_err(finalizer_error);
    finish(&ctx, script.as_ref(), result, Phase::Ready).await
}

fn error_policy(script: Arc<CephLuaScript>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile of CephLuaScript {} failed: {:?}", script.name_any(), error);
    ctx.metrics.reconcile_failure(script.as_ref(), error);
    Action::requeue(error.requeue_after().unwrap_or(TRANSIENT_REQUEUE))
}

pub async fn run(state: State, client: Client) {
    let scripts = Api::<CephLuaScript>::all(client.clone());
    Controller::new(scripts, Config::default().any_semantic())
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
        api::v1::{cephcluster::CephClusterSpec, pools::CephObjectStoreSpec},
        ceph::{command::CommandOutput, testing::MockExecutor},
        controllers::{context::testing, mon::tests::ceph_cluster},
        tests::{mock_client, ApiServer},
        util::errors::ErrorKind,
    };
    use http::Method;
    use serde_json::json;

    const GROUP: &str = "/apis/ceph.rook.io/v1/namespaces/rook-ceph";

    fn lua(name: &str, spec: CephLuaScriptSpec) -> CephLuaScript {
        let mut script = CephLuaScript::new(name, spec);
        script.metadata.namespace = Some("rook-ceph".to_string());
        script.metadata.uid = Some("uid-lua".to_string());
        script
    }

    fn inline(body: &str) -> CephLuaScriptSpec {
        CephLuaScriptSpec {
            object_store_name: "my-store".to_string(),
            object_store_namespace: "rook-ceph".to_string(),
            script: Some(body.to_string()),
            ..Default::default()
        }
    }

    async fn expect_cluster_and_store(server: &mut ApiServer) {
        let cluster = serde_json::to_value(ceph_cluster(CephClusterSpec::default())).unwrap();
        server
            .expect(
                Method::GET,
                &format!("{GROUP}/cephclusters"),
                200,
                json!({"apiVersion": "ceph.rook.io/v1", "kind": "CephClusterList", "metadata": {}, "items": [cluster]}),
            )
            .await;
        let mut store = CephObjectStore::new("my-store", CephObjectStoreSpec::default());
        store.metadata.namespace = Some("rook-ceph".to_string());
        server
            .expect(
                Method::GET,
                &format!("{GROUP}/cephobjectstores/my-store"),
                200,
                serde_json::to_value(store).unwrap(),
            )
            .await;
    }

    #[test]
    fn exactly_one_source_is_required() {
        assert!(validate(&lua("a", inline("print('hi')"))).is_ok());

        let none = lua("a", CephLuaScriptSpec::default());
        assert_eq!(validate(&none).unwrap_err().kind(), ErrorKind::Invalid);

        let mut both = inline("x");
        both.script_base64 = Some("eA==".to_string());
        assert!(validate(&lua("a", both)).is_err());

        let bad_url = CephLuaScriptSpec {
            script_url: Some("not a url".to_string()),
            ..Default::default()
        };
        assert!(validate(&lua("a", bad_url)).is_err());

        let mut background = inline("x");
        background.context = LuaScriptContext::Background;
        background.tenant = "acme".to_string();
        assert!(validate(&lua("a", background)).is_err());
    }

    #[test]
    fn markers_parse_and_reject_garbage() {
        let marker: ScriptMarker = "-- audit:rook-ceph:acme:12345".parse().unwrap();
        assert_eq!(marker.name, "audit");
        assert_eq!(marker.namespace, "rook-ceph");
        assert_eq!(marker.tenant, "acme");
        assert_eq!(marker.hash, "12345");
        assert_eq!(marker.to_string(), "-- audit:rook-ceph:acme:12345");

        assert!("print('no marker')".parse::<ScriptMarker>().is_err());
        assert!("--   ".parse::<ScriptMarker>().is_err());
        assert!("-- a:b:c".parse::<ScriptMarker>().is_err());
        assert!("".parse::<ScriptMarker>().is_err());
    }

    #[test]
    fn ownership_follows_the_marker() {
        let script = lua("audit", inline("print('v2')"));
        let own = ScriptMarker::for_script(&script, "print('v2')").to_string();
        assert_eq!(ownership(&own, &script, "print('v2')"), Ownership::UpToDate);

        let stale = ScriptMarker::for_script(&script, "print('v1')").to_string();
        assert_eq!(ownership(&stale, &script, "print('v2')"), Ownership::Write);
        assert_eq!(ownership("", &script, "print('v2')"), Ownership::Write);

        match ownership("-- other:rook-ceph::1", &script, "print('v2')") {
            Ownership::OwnedBy(owner) => assert_eq!(owner.name, "other"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn base64_sources_are_decoded() {
        let spec = CephLuaScriptSpec {
            script_base64: Some(STANDARD.encode("RGWDebugLog('hi')")),
            ..Default::default()
        };
        assert_eq!(script_body(&spec).await.unwrap(), "RGWDebugLog('hi')");
        let bad = CephLuaScriptSpec {
            script_base64: Some("***".to_string()),
            ..Default::default()
        };
        assert_eq!(script_body(&bad).await.unwrap_err().kind(), ErrorKind::Invalid);
    }

    #[test]
    fn background_scripts_have_no_tenant() {
        let mock = MockExecutor::new();
        let ceph = mock.client("rook-ceph");
        let mut spec = inline("x");
        spec.tenant = "acme".to_string();
        let rgw = RgwScript::new(&ceph, "zone-a", &spec);
        assert_eq!(
            rgw.args("get"),
            vec!["script", "get", "--context=preRequest", "--rgw-zone=zone-a", "--tenant=acme"]
        );
        spec.context = LuaScriptContext::Background;
        spec.tenant.clear();
        let rgw = RgwScript::new(&ceph, "zone-a", &spec);
        assert_eq!(rgw.args("rm"), vec!["script", "rm", "--context=background", "--rgw-zone=zone-a"]);
    }

    #[tokio::test]
    async fn script_owned_by_a_live_script_is_not_overwritten() {
        let mock = MockExecutor::new();
        mock.on(
            "radosgw-admin",
            "script get",
            Ok(CommandOutput::stdout("-- other:rook-ceph::42\nprint('theirs')")),
        );
        let (client, mut server) = mock_client();
        let ctx = testing::context(client, &mock);
        let script = lua("mine", inline("print('mine')"));

        let api = tokio::spawn(async move {
            expect_cluster_and_store(&mut server).await;
            let other = lua("other", inline("print('theirs')"));
            server
                .expect(
                    Method::GET,
                    &format!("{GROUP}/cephluascripts/other"),
                    200,
                    serde_json::to_value(other).unwrap(),
                )
                .await;
        });
        let err = apply(&script, &ctx).await.unwrap_err();
        api.await.unwrap();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("rook-ceph/other"));
        assert!(!mock.commands().iter().any(|c| c.contains("script put")));
    }

    #[tokio::test]
    async fn unmanaged_script_is_written_with_a_marker() {
        let mock = MockExecutor::new();
        let (client, mut server) = mock_client();
        let ctx = testing::context(client, &mock);
        let script = lua("mine", inline("print('mine')"));
        let status_object = serde_json::to_value(&script).unwrap();

        let api = tokio::spawn(async move {
            expect_cluster_and_store(&mut server).await;
            let status = format!("{GROUP}/cephluascripts/mine/status");
            server.expect(Method::GET, &status, 200, status_object.clone()).await;
            server.expect(Method::PATCH, &status, 200, status_object).await
        });
        apply(&script, &ctx).await.unwrap();
        let patch = api.await.unwrap();
        assert_eq!(patch["status"]["zone"]["name"], "my-store");

        let put = mock
            .commands()
            .into_iter()
            .find(|c| c.starts_with("radosgw-admin script put"))
            .unwrap();
        assert!(put.contains("--rgw-zone=my-store"));
        let infile = put
            .split(' ')
            .find_map(|a| a.strip_prefix("--infile="))
            .unwrap()
            .to_string();
        let written = std::fs::read_to_string(infile).unwrap();
        let first = written.lines().next().unwrap();
        assert!(first.starts_with("-- mine:rook-ceph::"));
        assert!(written.ends_with("print('mine')"));
    }
}
