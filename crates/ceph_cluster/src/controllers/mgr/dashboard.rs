//! Dashboard module: certificate, admin credentials, listener settings and its service

use k8s_openapi::{
    api::core::v1::{Secret, Service, ServicePort, ServiceSpec},
    apimachinery::pkg::{apis::meta::v1::OwnerReference, util::intstr::IntOrString},
    ByteString,
};
use kube::api::{Api, ObjectMeta, PostParams};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use std::collections::BTreeMap;
use tracing::{error, info};

use super::{orchestrator::enable_module, MGR_APP};
use crate::{
    api::v1::cephcluster::DashboardSpec,
    ceph::{
        command::{CERT_ALREADY_CONFIGURED, EINVAL},
        retry::{execute_with_retry, DEFAULT_RETRIES, DEFAULT_RETRY_WAIT},
        status::CephVersion,
        CephClient,
    },
    util::{
        errors::{Error, Result, ResultExt, StdError},
        k8s::{get_opt, labels, FIELD_MANAGER, MANAGED_BY_LABEL},
    },
};

pub const DASHBOARD_MODULE: &str = "dashboard";
pub const DASHBOARD_SERVICE: &str = "rook-ceph-mgr-dashboard";
pub const PASSWORD_SECRET: &str = "rook-ceph-dashboard-password";
pub const PASSWORD_KEY: &str = "password";
pub const PASSWORD_LENGTH: usize = 10;
pub const HTTPS_PORT: i32 = 8443;
pub const HTTP_PORT: i32 = 7000;
const USERNAME: &str = "admin";

/// Releases with `dashboard create-self-signed-cert`
pub const SELF_SIGNED_CERT_VERSION: CephVersion = CephVersion::new(15, 0, 0);

pub fn dashboard_port(spec: &DashboardSpec) -> i32 {
    match spec.port {
        Some(port) if port > 0 => port,
        _ if spec.ssl => HTTPS_PORT,
        _ => HTTP_PORT,
    }
}

/// Random alphanumeric password from the OS RNG
pub fn generate_password(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn dashboard_service(namespace: &str, spec: &DashboardSpec, owner: Option<&OwnerReference>) -> Service {
    let port_name = if spec.ssl { "https-dashboard" } else { "http-dashboard" };
    let port = dashboard_port(spec);
    let mut object_labels = labels(&[("app", MGR_APP)]);
    object_labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    Service {
        metadata: ObjectMeta {
            name: Some(DASHBOARD_SERVICE.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(object_labels),
            owner_references: owner.map(|o| vec![o.clone()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels(&[("app", MGR_APP)])),
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(port_name.to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `mgr/dashboard/*` settings the spec pins, in the order they are applied
pub fn desired_settings(spec: &DashboardSpec) -> Vec<(&'static str, String)> {
    let port = dashboard_port(spec).to_string();
    let mut settings = vec![
        ("mgr/dashboard/url_prefix", spec.url_prefix.clone().unwrap_or_default()),
        ("mgr/dashboard/ssl", spec.ssl.to_string()),
        ("mgr/dashboard/server_port", port.clone()),
    ];
    if spec.ssl {
        settings.push(("mgr/dashboard/ssl_server_port", port));
    }
    settings
}

/// Drives the dashboard module towards `spec`. When disabled the module is turned off; its
/// service is handled by the mgr services.
pub async fn configure(
    ceph: &CephClient,
    secrets: &Api<Secret>,
    spec: &DashboardSpec,
    owner: Option<&OwnerReference>,
    version: Option<CephVersion>,
) -> Result<()> {
    if !spec.enabled {
        if let Err(e) = ceph.mgr_disable_module(DASHBOARD_MODULE).await {
            error!("failed to disable the dashboard module: {}", e);
        }
        return Ok(());
    }

    enable_module(ceph, DASHBOARD_MODULE, true).await?;

    let cert_supported = version.map_or(true, |v| v.is_at_least(&SELF_SIGNED_CERT_VERSION));
    if spec.ssl && cert_supported {
        create_self_signed_cert(ceph).await?;
    }

    let password = password(secrets, owner).await?;
    set_login_credentials(ceph, &password).await?;

    let mut changed = Vec::new();
    for (key, value) in desired_settings(spec) {
        let current = ceph.config_get("mgr", key).await?;
        if current != value {
            info!("dashboard setting {} changes from {:?} to {:?}", key, current, value);
            changed.push((key, value));
        }
    }
    if changed.is_empty() {
        return Ok(());
    }

    info!("dashboard config has changed, restarting the dashboard module");
    ceph.mgr_disable_module(DASHBOARD_MODULE).await?;
    ceph.mgr_enable_module(DASHBOARD_MODULE, false).await?;
    for (key, value) in changed {
        ceph.config_set("mgr", key, &value).await?;
    }
    Ok(())
}

async fn create_self_signed_cert(ceph: &CephClient) -> Result<()> {
    let created = execute_with_retry(
        ceph.cancel_token(),
        "create dashboard cert",
        DEFAULT_RETRIES,
        &[EINVAL],
        DEFAULT_RETRY_WAIT,
        || async {
            ceph.run(&["dashboard", "create-self-signed-cert"]).await?;
            Ok(())
        },
    )
    .await;
    match created {
        Ok(()) => info!("dashboard cert created"),
        Err(e) if e.exit_code() == Some(CERT_ALREADY_CONFIGURED) => info!("dashboard is already initialized with a cert"),
        Err(e) => return Err(e),
    }
    Ok(())
}

async fn set_login_credentials(ceph: &CephClient, password: &str) -> Result<()> {
    info!("setting ceph dashboard {:?} login credentials", USERNAME);
    execute_with_retry(
        ceph.cancel_token(),
        "set dashboard login credentials",
        DEFAULT_RETRIES,
        &[EINVAL],
        DEFAULT_RETRY_WAIT,
        || async {
            ceph.run(&["dashboard", "set-login-credentials", USERNAME, password])
                .await
                .context("failed to set dashboard login credentials")?;
            Ok(())
        },
    )
    .await
}

/// The stored admin password, generated and saved on first use
async fn password(secrets: &Api<Secret>, owner: Option<&OwnerReference>) -> Result<String> {
    if let Some(secret) = get_opt(secrets, PASSWORD_SECRET)
        .await
        .context("failed to get dashboard secret")?
    {
        info!("the dashboard secret was already generated");
        return secret
            .data
            .as_ref()
            .and_then(|d| d.get(PASSWORD_KEY))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .ok_or_else(|| {
                Error::StdError(StdError::DecodingError(format!(
                    "secret {PASSWORD_SECRET} has no '{PASSWORD_KEY}'"
                )))
            });
    }

    let password = generate_password(PASSWORD_LENGTH);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(PASSWORD_SECRET.to_string()),
            labels: Some(labels(&[(MANAGED_BY_LABEL, FIELD_MANAGER)])),
            owner_references: owner.map(|o| vec![o.clone()]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            PASSWORD_KEY.to_string(),
            ByteString(password.clone().into_bytes()),
        )])),
        type_: Some("kubernetes.io/rook".to_string()),
        ..Default::default()
    };
    secrets
        .create(&PostParams::default(), &secret)
        .await
        .context("failed to save dashboard secret")?;
    Ok(password)
}
