//! Kubernetes objects of the mgr daemons: keyrings, deployments and the metrics service

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
        core::v1::{
            Affinity, Container, ContainerPort, EmptyDirVolumeSource, HTTPGetAction, HostPathVolumeSource, PodSpec,
            PodTemplateSpec, Probe, Secret, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume,
            VolumeMount,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, OwnerReference},
        util::intstr::IntOrString,
    },
    ByteString,
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

use super::{MGR_APP, METRICS_PORT, METRICS_SERVICE};
use crate::{
    api::v1::cephcluster::Placement,
    ceph::auth::{self, MGR_CAPS},
    controllers::mon::spec::{pod_ip_env, DAEMON_ID_LABEL, KEYRING_KEY, LOG_DIR, POD_IP_ENV},
    util::k8s::{FIELD_MANAGER, MANAGED_BY_LABEL},
};

pub const MGR_PORT: i32 = 6800;
const KEYRING_DIR: &str = "/etc/ceph/keyring-store";

#[derive(Debug, Clone)]
pub struct MgrSpecParams<'a> {
    pub namespace: &'a str,
    pub image: &'a str,
    pub data_dir_host_path: &'a str,
    pub host_network: bool,
    pub placement: &'a Placement,
    pub fsid: &'a str,
    pub mon_host: String,
    pub dashboard_port: Option<i32>,
}

pub fn mgr_name(daemon_id: &str) -> String {
    format!("{MGR_APP}-{daemon_id}")
}

pub fn keyring_secret_name(daemon_id: &str) -> String {
    format!("{}-keyring", mgr_name(daemon_id))
}

pub fn mgr_labels(namespace: &str, daemon_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), MGR_APP.to_string()),
        ("ceph_daemon_type".to_string(), "mgr".to_string()),
        (DAEMON_ID_LABEL.to_string(), daemon_id.to_string()),
        ("mgr".to_string(), daemon_id.to_string()),
        ("rook_cluster".to_string(), namespace.to_string()),
    ])
}

fn object_meta(name: String, namespace: &str, daemon_id: &str, owner: Option<&OwnerReference>) -> ObjectMeta {
    let mut labels = mgr_labels(namespace, daemon_id);
    labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        owner_references: owner.map(|o| vec![o.clone()]),
        ..Default::default()
    }
}

pub fn mgr_keyring_secret(namespace: &str, daemon_id: &str, key: &str, owner: Option<&OwnerReference>) -> Secret {
    let entity = format!("mgr.{daemon_id}");
    Secret {
        metadata: object_meta(keyring_secret_name(daemon_id), namespace, daemon_id, owner),
        data: Some(BTreeMap::from([(
            KEYRING_KEY.to_string(),
            ByteString(auth::keyring(&entity, key, &MGR_CAPS).into_bytes()),
        )])),
        type_: Some("kubernetes.io/rook".to_string()),
        ..Default::default()
    }
}

fn data_dir(daemon_id: &str) -> String {
    format!("/var/lib/ceph/mgr/ceph-{daemon_id}")
}

fn daemon_args(params: &MgrSpecParams<'_>, daemon_id: &str) -> Vec<String> {
    let mut args = vec![
        format!("--fsid={}", params.fsid),
        format!("--keyring={KEYRING_DIR}/{KEYRING_KEY}"),
        "--log-to-stderr=true".to_string(),
        "--err-to-stderr=true".to_string(),
        format!("--mon-host={}", params.mon_host),
        format!("--id={daemon_id}"),
        "--setuser=ceph".to_string(),
        "--setgroup=ceph".to_string(),
        "--client-mount-uid=0".to_string(),
        "--client-mount-gid=0".to_string(),
        "--foreground".to_string(),
    ];
    if !params.host_network {
        args.push(format!("--public-addr=$({POD_IP_ENV})"));
    }
    args
}

fn ports(params: &MgrSpecParams<'_>) -> Vec<ContainerPort> {
    let port = |name: &str, container_port: i32| ContainerPort {
        name: Some(name.to_string()),
        container_port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };
    let mut ports = vec![port("mgr", MGR_PORT), port("http-metrics", METRICS_PORT)];
    if let Some(dashboard) = params.dashboard_port {
        ports.push(port("dashboard", dashboard));
    }
    ports
}

fn mounts(daemon_id: &str) -> Vec<VolumeMount> {
    vec![
        VolumeMount {
            name: "mgr-keyring".to_string(),
            mount_path: KEYRING_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "mgr-data".to_string(),
            mount_path: data_dir(daemon_id),
            ..Default::default()
        },
        VolumeMount {
            name: "log".to_string(),
            mount_path: LOG_DIR.to_string(),
            ..Default::default()
        },
    ]
}

fn volumes(params: &MgrSpecParams<'_>, daemon_id: &str) -> Vec<Volume> {
    vec![
        Volume {
            name: "mgr-keyring".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(keyring_secret_name(daemon_id)),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "mgr-data".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "log".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: format!("{}/{}/log", params.data_dir_host_path, params.namespace),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

/// Deployment of the mgr `daemon_id`
pub fn mgr_deployment(params: &MgrSpecParams<'_>, daemon_id: &str, owner: Option<&OwnerReference>) -> Deployment {
    let labels = mgr_labels(params.namespace, daemon_id);
    let volume_mounts = mounts(daemon_id);

    let version = Container {
        name: "version".to_string(),
        image: Some(params.image.to_string()),
        command: Some(vec!["ceph".to_string()]),
        args: Some(vec!["--version".to_string()]),
        ..Default::default()
    };
    let chown = Container {
        name: "chown-container-data-dir".to_string(),
        image: Some(params.image.to_string()),
        command: Some(vec!["chown".to_string()]),
        args: Some(vec![
            "--verbose".to_string(),
            "--recursive".to_string(),
            "ceph:ceph".to_string(),
            LOG_DIR.to_string(),
            data_dir(daemon_id),
        ]),
        volume_mounts: Some(volume_mounts.clone()),
        ..Default::default()
    };

    let mgr = Container {
        name: "mgr".to_string(),
        image: Some(params.image.to_string()),
        command: Some(vec!["ceph-mgr".to_string()]),
        args: Some(daemon_args(params, daemon_id)),
        env: Some(vec![pod_ip_env()]),
        ports: Some(ports(params)),
        volume_mounts: Some(volume_mounts),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/".to_string()),
                port: IntOrString::Int(METRICS_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(60),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata: object_meta(mgr_name(daemon_id), params.namespace, daemon_id, owner),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(mgr_name(daemon_id)),
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![version, chown]),
                    containers: vec![mgr],
                    volumes: Some(volumes(params, daemon_id)),
                    host_network: params.host_network.then_some(true),
                    dns_policy: params
                        .host_network
                        .then(|| "ClusterFirstWithHostNet".to_string()),
                    affinity: params.placement.node_affinity.clone().map(|node_affinity| Affinity {
                        node_affinity: Some(node_affinity),
                        ..Default::default()
                    }),
                    tolerations: params.placement.tolerations.clone(),
                    restart_policy: Some("Always".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn deployment_needs_update(existing: &Deployment, desired: &Deployment) -> bool {
    let pod = |d: &Deployment| d.spec.as_ref().and_then(|s| s.template.spec.clone());
    let (Some(have), Some(want)) = (pod(existing), pod(desired)) else {
        return true;
    };
    let containers = |p: &PodSpec| {
        p.containers
            .iter()
            .map(|c| (c.image.clone(), c.args.clone(), c.ports.clone()))
            .collect::<Vec<_>>()
    };
    containers(&have) != containers(&want)
        || have.tolerations != want.tolerations
        || have.affinity != want.affinity
        || have.host_network != want.host_network
}

/// Prometheus endpoint of whichever mgr is active
pub fn metrics_service(namespace: &str, active: &str, owner: Option<&OwnerReference>) -> Service {
    let mut object_labels = BTreeMap::from([("app".to_string(), MGR_APP.to_string())]);
    object_labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    Service {
        metadata: ObjectMeta {
            name: Some(METRICS_SERVICE.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(object_labels),
            owner_references: owner.map(|o| vec![o.clone()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([
                ("app".to_string(), MGR_APP.to_string()),
                (DAEMON_ID_LABEL.to_string(), active.to_string()),
            ])),
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("http-metrics".to_string()),
                port: METRICS_PORT,
                target_port: Some(IntOrString::Int(METRICS_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn service_needs_update(existing: &Service, desired: &Service) -> bool {
    let shape = |s: &Service| {
        s.spec
            .as_ref()
            .map(|spec| (spec.selector.clone(), spec.ports.clone().unwrap_or_default()
                .into_iter()
                .map(|p| (p.name, p.port))
                .collect::<Vec<_>>()))
    };
    shape(existing) != shape(desired)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(placement: &Placement, host_network: bool) -> MgrSpecParams<'_> {
        MgrSpecParams {
            namespace: "rook-ceph",
            image: "quay.io/ceph/ceph:v18.2.0",
            data_dir_host_path: "/var/lib/rook",
            host_network,
            placement,
            fsid: "4b5c8c0a-ff60-454b-a1b4-9747aa737d19",
            mon_host: "10.0.0.1:6789".to_string(),
            dashboard_port: Some(8443),
        }
    }

    #[test]
    fn deployment_exposes_metrics_and_dashboard() {
        let placement = Placement::default();
        let dep = mgr_deployment(&params(&placement, false), "a", None);
        assert_eq!(dep.metadata.name.as_deref(), Some("rook-ceph-mgr-a"));
        let pod = dep.spec.unwrap().template.spec.unwrap();
        let mgr = &pod.containers[0];
        let ports: Vec<_> = mgr
            .ports
            .clone()
            .unwrap()
            .into_iter()
            .map(|p| (p.name.unwrap(), p.container_port))
            .collect();
        assert_eq!(
            ports,
            vec![
                ("mgr".to_string(), 6800),
                ("http-metrics".to_string(), 9283),
                ("dashboard".to_string(), 8443)
            ]
        );
        let probe = mgr.liveness_probe.clone().unwrap();
        assert_eq!(probe.http_get.unwrap().port, IntOrString::Int(9283));
        assert!(mgr
            .args
            .as_ref()
            .unwrap()
            .contains(&"--public-addr=$(ROOK_POD_IP)".to_string()));
        let keyring = pod.volumes.unwrap().into_iter().find(|v| v.name == "mgr-keyring").unwrap();
        assert_eq!(
            keyring.secret.unwrap().secret_name.as_deref(),
            Some("rook-ceph-mgr-a-keyring")
        );
    }

    #[test]
    fn host_network_mgrs_use_the_node_address() {
        let placement = Placement::default();
        let dep = mgr_deployment(&params(&placement, true), "b", None);
        let pod = dep.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.host_network, Some(true));
        assert!(!pod.containers[0]
            .args
            .as_ref()
            .unwrap()
            .iter()
            .any(|a| a.starts_with("--public-addr")));
    }

    #[test]
    fn keyring_grants_mgr_caps() {
        let secret = mgr_keyring_secret("rook-ceph", "a", "AQBsecret==", None);
        let keyring = String::from_utf8(secret.data.unwrap()[KEYRING_KEY].0.clone()).unwrap();
        assert!(keyring.contains("[mgr.a]"));
        assert!(keyring.contains("AQBsecret=="));
        assert!(keyring.contains("allow profile mgr"));
    }

    #[test]
    fn metrics_follow_the_active_mgr() {
        let a = metrics_service("rook-ceph", "a", None);
        assert_eq!(a.spec.as_ref().unwrap().selector.as_ref().unwrap()["ceph_daemon_id"], "a");
        let b = metrics_service("rook-ceph", "b", None);
        assert!(service_needs_update(&a, &b));
        assert!(!service_needs_update(&a, &a));
    }
}
