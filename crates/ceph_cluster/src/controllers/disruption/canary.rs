//! Drain canaries: one do-nothing deployment per OSD node. A node drain cordons the node, the
//! canary pod cannot come back, and the unready canary marks its failure domain as draining.

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec, Toleration},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference},
};
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta},
    ResourceExt,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::drain::CanaryInfo;
use crate::{
    placement::HOSTNAME_LABEL,
    util::{
        errors::{Result, ResultExt},
        k8s::{create_or_update, delete_if_exists, FIELD_MANAGER, MANAGED_BY_LABEL},
    },
};

pub const CANARY_APP: &str = "rook-ceph-drain-canary";
pub const NODE_NAME_LABEL: &str = "node_name";
pub const TOPOLOGY_LABEL_PREFIX: &str = "topology-location-";
const UNSCHEDULABLE_TAINT: &str = "node.kubernetes.io/unschedulable";
const MAX_NAME_LEN: usize = 63;

/// `rook-ceph-drain-canary-<node>`, hashed down when the node name is too long for a label
pub fn canary_name(node: &str) -> String {
    let name = format!("{CANARY_APP}-{node}");
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let hash = hex::encode(&Sha256::digest(node.as_bytes())[..8]);
    format!("{CANARY_APP}-{hash}")
}

/// What a canary needs to know about the node it watches
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OsdNode {
    pub hostname: String,
    pub topology: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
}

impl OsdNode {
    /// Merges the tolerations of another OSD on the same node, minus the drain taint
    pub fn add_tolerations(&mut self, tolerations: &[Toleration]) {
        for t in tolerations {
            if t.key.as_deref() == Some(UNSCHEDULABLE_TAINT) {
                warn!("an osd on {} tolerates the drain taint; its canary will not", self.hostname);
                continue;
            }
            if !self.tolerations.contains(t) {
                self.tolerations.push(t.clone());
            }
        }
    }
}

pub fn canary_deployment(node: &str, osd_node: &OsdNode, image: &str, owner: Option<OwnerReference>) -> Deployment {
    let mut labels = BTreeMap::from([
        ("app".to_string(), CANARY_APP.to_string()),
        (HOSTNAME_LABEL.to_string(), osd_node.hostname.clone()),
        (NODE_NAME_LABEL.to_string(), node.to_string()),
    ]);
    let selector = labels.clone();
    labels.extend(osd_node.topology.clone());
    let mut object_labels = labels.clone();
    object_labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());

    Deployment {
        metadata: ObjectMeta {
            name: Some(canary_name(node)),
            labels: Some(object_labels),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_selector: Some(BTreeMap::from([(
                        HOSTNAME_LABEL.to_string(),
                        osd_node.hostname.clone(),
                    )])),
                    containers: vec![Container {
                        name: "sleep".to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec!["sleep".to_string()]),
                        args: Some(vec!["infinity".to_string()]),
                        ..Default::default()
                    }],
                    tolerations: (!osd_node.tolerations.is_empty()).then(|| osd_node.tolerations.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn is_ready(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
        >= 1
}

/// Reads a canary back. `level` is the pool failure domain.
pub fn canary_info(deployment: &Deployment, level: &str) -> Option<CanaryInfo> {
    let labels = deployment.labels();
    let node = labels.get(NODE_NAME_LABEL)?.clone();
    let domain = labels
        .get(&format!("{TOPOLOGY_LABEL_PREFIX}{level}"))
        .cloned()
        .or_else(|| (level == "host").then(|| labels.get(HOSTNAME_LABEL).cloned()).flatten());
    Some(CanaryInfo {
        name: deployment.name_any(),
        node,
        domain,
        ready: is_ready(deployment),
        created: deployment.metadata.creation_timestamp.as_ref().map(|t| t.0),
    })
}

pub async fn list_canaries(api: &Api<Deployment>) -> Result<Vec<Deployment>> {
    Ok(api
        .list(&ListParams::default().labels(&format!("app={CANARY_APP}")))
        .await
        .context("failed to list drain canaries")?
        .items)
}

/// Creates a canary on every OSD node and removes ready canaries of nodes without OSDs. An
/// unready canary on a node without OSDs is kept: that node is draining.
pub async fn reconcile_canaries(
    api: &Api<Deployment>,
    osd_nodes: &BTreeMap<String, OsdNode>,
    existing: &[Deployment],
    image: &str,
    owner: Option<OwnerReference>,
) -> Result<()> {
    for (node, osd_node) in osd_nodes {
        let desired = canary_deployment(node, osd_node, image, owner.clone());
        create_or_update(api, &desired, |have, want| {
            have.labels() != want.labels()
                || have
                    .spec
                    .as_ref()
                    .and_then(|s| s.template.spec.as_ref())
                    .map(|s| &s.tolerations)
                    != want.spec.as_ref().and_then(|s| s.template.spec.as_ref()).map(|s| &s.tolerations)
        })
        .await
        .with_context(|| format!("failed to reconcile drain canary of node {node}"))?;
    }

    let osd_node_names: BTreeSet<&str> = osd_nodes.keys().map(String::as_str).collect();
    for canary in existing {
        let Some(node) = canary.labels().get(NODE_NAME_LABEL) else {
            continue;
        };
        if osd_node_names.contains(node.as_str()) {
            continue;
        }
        if is_ready(canary) {
            info!("node {} runs no osds any more, deleting its drain canary", node);
            delete_if_exists(api, &canary.name_any(), &DeleteParams::default()).await?;
        } else {
            debug!("keeping unready drain canary of node {} without osds", node);
        }
    }
    Ok(())
}
