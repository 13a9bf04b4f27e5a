//! Kubernetes objects of one mon: deployment, service, optional PVC and the shared keyring

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
        core::v1::{
            Affinity, Container, ContainerPort, EnvVar, EnvVarSource, HostPathVolumeSource, ObjectFieldSelector,
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
            PodTemplateSpec, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
            VolumeResourceRequirements,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, OwnerReference},
        util::intstr::IntOrString,
    },
    ByteString,
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

use super::MSGR2_PORT;
use crate::{
    api::v1::cephcluster::{MonVolumeClaimTemplate, Placement},
    ceph::auth,
    cluster_info::{ClusterInfo, MonConfig, NodeInfo, DEFAULT_MON_PORT, MON_APP},
    placement::HOSTNAME_LABEL,
    util::k8s::{FIELD_MANAGER, MANAGED_BY_LABEL},
};

pub const MON_KEYRING_SECRET: &str = "rook-ceph-mons-keyring";
pub const KEYRING_KEY: &str = "keyring";
pub const DAEMON_ID_LABEL: &str = "ceph_daemon_id";
pub const MON_LABEL: &str = "mon";
pub const MON_CLUSTER_LABEL: &str = "mon_cluster";
pub const STRETCH_ZONE_LABEL: &str = "stretch-zone";

const KEYRING_DIR: &str = "/etc/ceph/keyring-store";
pub(crate) const LOG_DIR: &str = "/var/log/ceph";
pub(crate) const POD_IP_ENV: &str = "ROOK_POD_IP";

/// Everything about the cluster a mon deployment depends on
#[derive(Debug, Clone)]
pub struct MonSpecParams<'a> {
    pub namespace: &'a str,
    pub image: &'a str,
    pub data_dir_host_path: &'a str,
    pub host_network: bool,
    pub placement: &'a Placement,
    pub volume_claim: Option<&'a MonVolumeClaimTemplate>,
    pub fsid: &'a str,
    pub mon_host: String,
}

/// Labels of a mon's pods and objects. `stretch-zone` only in stretch clusters.
pub fn mon_labels(namespace: &str, mon: &MonConfig) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        ("app".to_string(), MON_APP.to_string()),
        (MON_LABEL.to_string(), mon.daemon_id.clone()),
        (MON_CLUSTER_LABEL.to_string(), namespace.to_string()),
        (DAEMON_ID_LABEL.to_string(), mon.daemon_id.clone()),
    ]);
    if let Some(zone) = &mon.zone {
        labels.insert(STRETCH_ZONE_LABEL.to_string(), zone.clone());
    }
    labels
}

fn selector_labels(namespace: &str, mon: &MonConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), MON_APP.to_string()),
        (MON_LABEL.to_string(), mon.daemon_id.clone()),
        (MON_CLUSTER_LABEL.to_string(), namespace.to_string()),
    ])
}

fn object_meta(name: &str, namespace: &str, mon: &MonConfig, owner: Option<&OwnerReference>) -> ObjectMeta {
    let mut labels = mon_labels(namespace, mon);
    labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        owner_references: owner.map(|o| vec![o.clone()]),
        ..Default::default()
    }
}

pub fn mon_service(namespace: &str, mon: &MonConfig, owner: Option<&OwnerReference>) -> Service {
    Service {
        metadata: object_meta(&mon.resource_name, namespace, mon, owner),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(namespace, mon)),
            ports: Some(vec![
                ServicePort {
                    name: Some("tcp-msgr1".to_string()),
                    port: DEFAULT_MON_PORT,
                    target_port: Some(IntOrString::Int(DEFAULT_MON_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("tcp-msgr2".to_string()),
                    port: MSGR2_PORT,
                    target_port: Some(IntOrString::Int(MSGR2_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mon_pvc(
    namespace: &str,
    mon: &MonConfig,
    template: &MonVolumeClaimTemplate,
    owner: Option<&OwnerReference>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: object_meta(&mon.resource_name, namespace, mon, owner),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: template.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(template.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Secret with the `mon.` and admin keys every mon reads at startup
pub fn mon_keyring_secret(info: &ClusterInfo, owner: Option<&OwnerReference>) -> k8s_openapi::api::core::v1::Secret {
    k8s_openapi::api::core::v1::Secret {
        metadata: ObjectMeta {
            name: Some(MON_KEYRING_SECRET.to_string()),
            namespace: Some(info.namespace.clone()),
            labels: Some(BTreeMap::from([
                ("app".to_string(), MON_APP.to_string()),
                (MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string()),
            ])),
            owner_references: owner.map(|o| vec![o.clone()]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            KEYRING_KEY.to_string(),
            ByteString(auth::mon_keyring(&info.mon_secret, &info.admin_secret).into_bytes()),
        )])),
        type_: Some("kubernetes.io/rook".to_string()),
        ..Default::default()
    }
}

fn mon_data_dir(daemon_id: &str) -> String {
    format!("/var/lib/ceph/mon/ceph-{daemon_id}")
}

/// Flags shared by the mkfs init container and the daemon
fn common_args(params: &MonSpecParams<'_>, mon: &MonConfig) -> Vec<String> {
    vec![
        format!("--fsid={}", params.fsid),
        format!("--keyring={KEYRING_DIR}/{KEYRING_KEY}"),
        "--log-to-stderr=true".to_string(),
        "--err-to-stderr=true".to_string(),
        format!("--mon-host={}", params.mon_host),
        format!("--id={}", mon.daemon_id),
        "--setuser=ceph".to_string(),
        "--setgroup=ceph".to_string(),
        format!("--mon-data={}", mon_data_dir(&mon.daemon_id)),
    ]
}

fn daemon_args(params: &MonSpecParams<'_>, mon: &MonConfig) -> Vec<String> {
    let mut args = common_args(params, mon);
    args.push("--foreground".to_string());
    args.push(format!("--public-addr={}:{}", mon.public_ip, mon.port));
    if !params.host_network {
        args.push(format!("--public-bind-addr=$({POD_IP_ENV})"));
    }
    args
}

fn volume_mounts(mon: &MonConfig) -> Vec<VolumeMount> {
    vec![
        VolumeMount {
            name: "mon-keyring".to_string(),
            mount_path: KEYRING_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "mon-data".to_string(),
            mount_path: mon_data_dir(&mon.daemon_id),
            ..Default::default()
        },
        VolumeMount {
            name: "log".to_string(),
            mount_path: LOG_DIR.to_string(),
            ..Default::default()
        },
    ]
}

fn volumes(params: &MonSpecParams<'_>, mon: &MonConfig) -> Vec<Volume> {
    let data = match params.volume_claim {
        Some(_) => Volume {
            name: "mon-data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: mon.resource_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        None => Volume {
            name: "mon-data".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: format!("{}/mon-{}/data", params.data_dir_host_path, mon.daemon_id),
                ..Default::default()
            }),
            ..Default::default()
        },
    };
    vec![
        Volume {
            name: "mon-keyring".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(MON_KEYRING_SECRET.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        data,
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

pub(crate) fn pod_ip_env() -> EnvVar {
    EnvVar {
        name: POD_IP_ENV.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "status.podIP".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The deployment of one mon, pinned to `node` when one was assigned
pub fn mon_deployment(
    params: &MonSpecParams<'_>,
    mon: &MonConfig,
    node: Option<&NodeInfo>,
    owner: Option<&OwnerReference>,
) -> Deployment {
    let labels = mon_labels(params.namespace, mon);
    let mounts = volume_mounts(mon);

    let chown = Container {
        name: "chown-container-data-dir".to_string(),
        image: Some(params.image.to_string()),
        command: Some(vec!["chown".to_string()]),
        args: Some(vec![
            "--verbose".to_string(),
            "--recursive".to_string(),
            "ceph:ceph".to_string(),
            LOG_DIR.to_string(),
            mon_data_dir(&mon.daemon_id),
        ]),
        volume_mounts: Some(mounts.clone()),
        ..Default::default()
    };

    let mut mkfs_args = common_args(params, mon);
    mkfs_args.insert(0, "--mkfs".to_string());
    let init_fs = Container {
        name: "init-mon-fs".to_string(),
        image: Some(params.image.to_string()),
        command: Some(vec!["ceph-mon".to_string()]),
        args: Some(mkfs_args),
        volume_mounts: Some(mounts.clone()),
        ..Default::default()
    };

    let ports = (!params.host_network).then(|| {
        vec![
            ContainerPort {
                name: Some("tcp-msgr1".to_string()),
                container_port: DEFAULT_MON_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("tcp-msgr2".to_string()),
                container_port: MSGR2_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]
    });
    let daemon = Container {
        name: "mon".to_string(),
        image: Some(params.image.to_string()),
        command: Some(vec!["ceph-mon".to_string()]),
        args: Some(daemon_args(params, mon)),
        env: Some(vec![pod_ip_env()]),
        ports,
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let node_selector = node.map(|n| {
        BTreeMap::from([(HOSTNAME_LABEL.to_string(), n.hostname.clone())])
    });

    Deployment {
        metadata: object_meta(&mon.resource_name, params.namespace, mon, owner),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(params.namespace, mon)),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(mon.resource_name.clone()),
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![chown, init_fs]),
                    containers: vec![daemon],
                    volumes: Some(volumes(params, mon)),
                    node_selector,
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

/// Whether a running mon deployment differs from the desired one in a way that needs a restart
pub fn deployment_needs_update(existing: &Deployment, desired: &Deployment) -> bool {
    let pod = |d: &Deployment| d.spec.as_ref().and_then(|s| s.template.spec.clone());
    let (Some(have), Some(want)) = (pod(existing), pod(desired)) else {
        return true;
    };
    let containers = |p: &PodSpec| {
        p.containers
            .iter()
            .map(|c| (c.image.clone(), c.args.clone()))
            .collect::<Vec<_>>()
    };
    containers(&have) != containers(&want)
        || have.node_selector != want.node_selector
        || have.tolerations != want.tolerations
        || have.volumes != want.volumes
        || existing.metadata.labels != desired.metadata.labels
}
