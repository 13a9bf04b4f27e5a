//! Mon lifecycle: bring the monitor quorum to the desired size, replace failed mons and remove
//! surplus ones. All of it runs under the cluster's orchestration lock.

pub mod health;
pub mod spec;
pub mod zones;

use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{Node, PersistentVolumeClaim, Pod, Secret, Service},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    api::{Api, DeleteParams, ListParams},
    Client, ResourceExt,
};
use tokio::time::Duration;
use tracing::*;

use self::{
    spec::{deployment_needs_update, mon_deployment, mon_keyring_secret, mon_pvc, mon_service, MonSpecParams},
    zones::{arbiter_mon, extra_mon_to_remove, zone_for_new_mon, MonPlacement},
};
use crate::{
    api::v1::cephcluster::{CephCluster, MonSpec},
    ceph::{status::CephVersion, CephClient},
    cluster_info::{
        index_to_name, name_to_index, ClusterInfo, ClusterInfoStore, MonConfig, MonInfo, DEFAULT_MON_PORT, MON_APP,
    },
    controllers::disruption::pdb::{allow_mon_drain, block_mon_drain, PdbClient},
    placement::{
        assign_mons, available_nodes, failure_domain_label, mon_zones, zone_capacity, AssignOptions,
        MON_CANARY_LABEL, ZONE_LABEL,
    },
    util::{
        errors::{Error, Result, ResultExt, StdError, TRANSIENT_REQUEUE},
        k8s::{create_or_update, delete_if_exists, delete_now, get_opt, namespace_of, owner_reference, scale_deployment},
    },
};

pub const MAX_MON_COUNT: i32 = 9;
pub const DEFAULT_MON_COUNT: i32 = 3;
pub const MSGR2_PORT: i32 = 3300;

/// First release that can replace the arbiter of a stretch cluster
pub const ARBITER_FAILOVER_VERSION: CephVersion = CephVersion::new(16, 2, 7);

/// How long a started mon may take to join the quorum
#[derive(Debug, Clone, Copy)]
pub struct QuorumWait {
    pub retries: usize,
    pub interval: Duration,
}

impl Default for QuorumWait {
    fn default() -> Self {
        Self {
            retries: 20,
            interval: Duration::from_secs(5),
        }
    }
}

/// Number of mons to run. Counts above 9 are clamped; stretch clusters must fit their zones.
pub fn desired_mon_count(spec: &MonSpec) -> Result<usize> {
    if spec.count < 1 {
        return Err(Error::Invalid(format!("mon count must be at least 1, got {}", spec.count)));
    }
    let mut count = spec.count;
    if count > MAX_MON_COUNT {
        warn!("mon count {} exceeds the maximum, running {} mons", count, MAX_MON_COUNT);
        count = MAX_MON_COUNT;
    }
    if count % 2 == 0 {
        warn!("an even number of mons ({}) does not improve availability over {}", count, count - 1);
    }
    if let Some(stretch) = spec.stretch_cluster.as_ref().filter(|s| !s.zones.is_empty()) {
        let arbiters = stretch.zones.iter().filter(|z| z.arbiter).count();
        if arbiters != 1 {
            return Err(Error::Invalid(format!(
                "a stretch cluster needs exactly one arbiter zone, found {arbiters}"
            )));
        }
        let capacity: usize = stretch.zones.iter().map(|z| zone_capacity(z.arbiter)).sum();
        if count as usize > capacity {
            return Err(Error::Invalid(format!(
                "{count} mons do not fit the {} stretch zones",
                stretch.zones.len()
            )));
        }
    }
    Ok(count as usize)
}

/// The mons of one cluster together with the persisted cluster identity and monitor map
pub struct MonCluster {
    client: Client,
    ceph: CephClient,
    cluster: CephCluster,
    namespace: String,
    owner: Option<OwnerReference>,
    store: ClusterInfoStore,
    pub info: ClusterInfo,
    pub quorum_wait: QuorumWait,
}

impl MonCluster {
    /// A cluster whose identity is not loaded yet; see [`MonCluster::load`]
    pub fn new(client: Client, ceph: CephClient, cluster: &CephCluster) -> Result<Self> {
        let namespace = namespace_of(cluster)?;
        // external clusters never get a generated identity
        let owner = if cluster.is_external() {
            None
        } else {
            Some(owner_reference(cluster)?)
        };
        Ok(Self {
            store: ClusterInfoStore::new(client.clone(), &namespace, owner.clone()),
            info: ClusterInfo::new(&namespace),
            client,
            ceph,
            cluster: cluster.clone(),
            namespace,
            owner,
            quorum_wait: QuorumWait::default(),
        })
    }

    pub async fn load(client: Client, ceph: CephClient, cluster: &CephCluster) -> Result<Self> {
        let mut mons = Self::new(client, ceph, cluster)?;
        mons.init_cluster_info().await?;
        Ok(mons)
    }

    pub fn cluster(&self) -> &CephCluster {
        &self.cluster
    }

    pub fn ceph(&self) -> &CephClient {
        &self.ceph
    }

    pub fn store(&self) -> &ClusterInfoStore {
        &self.store
    }

    async fn init_cluster_info(&mut self) -> Result<()> {
        self.info = self.store.create_or_load(&self.ceph).await?;
        self.info.ceph_version = self
            .cluster
            .spec
            .ceph_version
            .version
            .as_deref()
            .and_then(CephVersion::parse);
        if !self.info.monitors.is_empty() {
            self.store.write_connection_config(&self.info, &self.ceph).await?;
        }
        Ok(())
    }

    fn zone_label(&self) -> &str {
        self.cluster
            .spec
            .mon
            .stretch_cluster
            .as_ref()
            .map(failure_domain_label)
            .unwrap_or(ZONE_LABEL)
    }

    fn resource_name(id: &str) -> String {
        format!("{MON_APP}-{id}")
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&ListParams::default()).await.context("failed to list nodes")?.items)
    }

    async fn list_mon_pods(&self) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(pods
            .list(&ListParams::default().labels(&format!("app={MON_APP}")))
            .await
            .context("failed to list mon pods")?
            .items)
    }

    /// Refuses to touch a cluster whose live monmap belongs to another fsid
    async fn check_fsid(&self) -> Result<()> {
        if self.info.monitors.is_empty() {
            return Ok(());
        }
        match self.ceph.mon_quorum_status().await {
            Ok(status) if !status.monmap.fsid.is_empty() && status.monmap.fsid != self.info.fsid => Err(Error::fatal(
                "FsidMismatch",
                format!(
                    "mons report fsid {} but the cluster secret holds {}",
                    status.monmap.fsid, self.info.fsid
                ),
            )),
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("could not read the monmap before starting mons: {}", e);
                Ok(())
            }
        }
    }

    /// Existing mons followed by new ones until `desired` mons exist
    fn mon_configs(&self, desired: usize, nodes: &[Node]) -> Result<Vec<MonConfig>> {
        let stretch = self.cluster.spec.mon.stretch_cluster.as_ref();
        let mut zones = mon_zones(&self.info.mapping, nodes, self.zone_label());
        let pvc = self.cluster.spec.mon.volume_claim_template.is_some();

        let mut mons: Vec<MonConfig> = self
            .info
            .monitors
            .values()
            .map(|m| {
                let mut mon = MonConfig::new(&m.name, m.port());
                mon.public_ip = m.ip().to_string();
                mon.zone = zones.get(&m.name).cloned();
                mon.pvc_name = pvc.then(|| mon.resource_name.clone());
                mon
            })
            .collect();

        let mut next = self.info.max_mon_id + 1;
        while mons.len() < desired {
            let id = index_to_name(next);
            next += 1;
            let mut mon = MonConfig::new(&id, DEFAULT_MON_PORT);
            mon.zone = zone_for_new_mon(stretch, &zones)?;
            if let Some(zone) = &mon.zone {
                zones.insert(id.clone(), zone.clone());
            }
            mon.pvc_name = pvc.then(|| mon.resource_name.clone());
            mons.push(mon);
        }
        Ok(mons)
    }

    fn assign(&mut self, mons: &mut [MonConfig], nodes: &[Node], mon_pods: &[Pod]) -> Result<()> {
        let spec = &self.cluster.spec;
        let placement = spec.placement.mon_placement();
        let available = available_nodes(nodes, mon_pods, &placement, spec.mon.allow_multiple_per_node);
        let zone_label = self.zone_label().to_string();
        assign_mons(
            mons,
            &available,
            &mut self.info.mapping,
            AssignOptions {
                host_network: spec.network.host_network,
                allow_multiple: spec.mon.allow_multiple_per_node,
                zone_label: &zone_label,
            },
        )
    }

    /// Brings every configured mon up, one at a time, waiting for each to join the quorum
    pub async fn start(&mut self) -> Result<()> {
        if self.info.fsid.is_empty() {
            self.init_cluster_info().await?;
        }
        let desired = desired_mon_count(&self.cluster.spec.mon)?;
        self.check_fsid().await?;

        let nodes = self.list_nodes().await?;
        let mon_pods = self.list_mon_pods().await?;
        let mut mons = self.mon_configs(desired, &nodes)?;
        self.assign(&mut mons, &nodes, &mon_pods)?;
        self.ensure_keyring().await?;

        info!("targeting {} mons in cluster {}", desired, self.namespace);
        let mut members = Vec::new();
        for mon in mons.iter_mut() {
            self.init_mon_ip(mon).await?;
            self.info
                .monitors
                .insert(mon.daemon_id.clone(), MonInfo::new(&mon.daemon_id, &mon.public_ip, mon.port));
            if let Ok(index) = name_to_index(&mon.daemon_id) {
                self.info.max_mon_id = self.info.max_mon_id.max(index);
            }
            self.store.save(&self.info).await?;
            self.store.write_connection_config(&self.info, &self.ceph).await?;

            self.start_mon(mon).await?;
            members.push(mon.daemon_id.clone());
            self.wait_for_quorum(&members).await?;
        }

        self.remove_orphan_pvcs().await;
        Ok(())
    }

    async fn ensure_keyring(&self) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        create_or_update(&secrets, &mon_keyring_secret(&self.info, self.owner.as_ref()), |have, want| {
            have.data != want.data
        })
        .await
        .context("failed to save the mon keyring")?;
        Ok(())
    }

    /// Public address of a mon: the node address under host networking, else the clusterIP of
    /// its service
    async fn init_mon_ip(&self, mon: &mut MonConfig) -> Result<()> {
        if self.cluster.spec.network.host_network {
            let node = self.info.mapping.node.get(&mon.daemon_id).ok_or_else(|| {
                Error::StdError(StdError::NoNodesAvailable(format!(
                    "mon {} has no node assignment",
                    mon.daemon_id
                )))
            })?;
            mon.public_ip = node.address.clone();
            return Ok(());
        }

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let desired = mon_service(&self.namespace, mon, self.owner.as_ref());
        let service = create_or_update(&services, &desired, |have, want| {
            let ports = |s: &Service| s.spec.as_ref().and_then(|s| s.ports.clone());
            let selector = |s: &Service| s.spec.as_ref().and_then(|s| s.selector.clone());
            ports(have) != ports(want) || selector(have) != selector(want)
        })
        .await
        .with_context(|| format!("failed to create service for mon {}", mon.daemon_id))?;

        let ip = service
            .spec
            .and_then(|s| s.cluster_ip)
            .filter(|ip| !ip.is_empty() && ip != "None");
        match ip {
            Some(ip) => {
                mon.public_ip = ip;
                Ok(())
            }
            None => Err(Error::requeue(
                StdError::MetadataMissing(format!("service {} has no cluster ip yet", mon.resource_name)),
                TRANSIENT_REQUEUE,
            )),
        }
    }

    async fn start_mon(&self, mon: &MonConfig) -> Result<()> {
        let spec = &self.cluster.spec;
        if let Some(template) = &spec.mon.volume_claim_template {
            let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &self.namespace);
            // claims are immutable once bound
            create_or_update(&pvcs, &mon_pvc(&self.namespace, mon, template, self.owner.as_ref()), |_, _| false)
                .await
                .with_context(|| format!("failed to create pvc for mon {}", mon.daemon_id))?;
        }

        let placement = spec.placement.mon_placement();
        let params = MonSpecParams {
            namespace: &self.namespace,
            image: &spec.ceph_version.image,
            data_dir_host_path: &spec.data_dir_host_path,
            host_network: spec.network.host_network,
            placement: &placement,
            volume_claim: spec.mon.volume_claim_template.as_ref(),
            fsid: &self.info.fsid,
            mon_host: self.info.mon_host(),
        };
        let node = self.info.mapping.node.get(&mon.daemon_id);
        let desired = mon_deployment(&params, mon, node, self.owner.as_ref());
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        create_or_update(&deployments, &desired, deployment_needs_update)
            .await
            .with_context(|| format!("failed to start mon {}", mon.daemon_id))?;
        Ok(())
    }

    /// Polls the quorum until every mon of `members` is in it
    pub async fn wait_for_quorum(&self, members: &[String]) -> Result<()> {
        let cancel = self.ceph.cancel_token().clone();
        let QuorumWait { retries, interval } = self.quorum_wait;
        for attempt in 1..=retries {
            match self.ceph.mon_quorum_status().await {
                Ok(status) => {
                    let missing: Vec<&str> = members
                        .iter()
                        .map(String::as_str)
                        .filter(|m| !status.in_quorum(m))
                        .collect();
                    if missing.is_empty() {
                        info!("mons {:?} are in quorum", members);
                        return Ok(());
                    }
                    debug!("mons {:?} not in quorum yet (attempt {}/{})", missing, attempt, retries);
                }
                Err(e) if cancel.is_cancelled() => return Err(e),
                Err(e) => debug!("quorum status not available yet (attempt {}/{}): {}", attempt, retries, e),
            }
            if attempt < retries {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::StdError(StdError::Cancelled)),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
        Err(Error::requeue(
            StdError::Timeout(format!("mons {members:?} did not join the quorum")),
            TRANSIENT_REQUEUE,
        ))
    }

    /// Placement of every known mon, sorted by id
    fn mon_placements(&self, nodes: &[Node]) -> Vec<MonPlacement> {
        let zones = mon_zones(&self.info.mapping, nodes, self.zone_label());
        self.info
            .monitors
            .keys()
            .map(|id| MonPlacement {
                id: id.clone(),
                node: self.info.mapping.node.get(id).map(|n| n.name.clone()),
                zone: zones.get(id).cloned(),
            })
            .collect()
    }

    /// Removes one mon beyond the desired count
    pub async fn remove_extra_mon(&mut self) -> Result<()> {
        let nodes = self.list_nodes().await?;
        let placements = self.mon_placements(&nodes);
        match extra_mon_to_remove(&placements, self.cluster.spec.mon.stretch_cluster.as_ref()) {
            Some(id) => self.remove_mon(&id).await,
            None => {
                info!("did not identify a mon to remove");
                Ok(())
            }
        }
    }

    /// A mon sharing its node with another while that is not allowed
    pub async fn mon_to_evict(&self) -> Result<Option<String>> {
        if self.cluster.spec.mon.allow_multiple_per_node {
            return Ok(None);
        }
        let pods = self.list_mon_pods().await?;
        let mut placements: Vec<MonPlacement> = pods
            .iter()
            .filter(|p| !p.labels().contains_key(MON_CANARY_LABEL))
            .filter_map(|p| {
                let node = p.spec.as_ref()?.node_name.clone()?;
                Some(MonPlacement {
                    id: p.labels().get(spec::MON_LABEL)?.clone(),
                    node: Some(node),
                    zone: None,
                })
            })
            .collect();
        placements.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(zones::mon_sharing_a_node(&placements))
    }

    pub async fn remove_mon(&mut self, name: &str) -> Result<()> {
        self.remove_mon_with_optional_quorum(name, true).await
    }

    /// Best effort removal of a mon and everything it owns; only the final save can fail
    async fn remove_mon_with_optional_quorum(&mut self, name: &str, from_quorum: bool) -> Result<()> {
        info!("ensuring removal of mon {}", name);
        let resource = Self::resource_name(name);

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(e) = delete_if_exists(&deployments, &resource, &delete_now()).await {
            error!("failed to remove mon deployment {}: {}", resource, e);
        }
        if from_quorum {
            if let Err(e) = self.ceph.mon_remove(name).await {
                error!("failed to remove mon {} from quorum: {}", name, e);
            }
        }
        self.info.remove_mon(name);

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(e) = delete_if_exists(&services, &resource, &delete_now()).await {
            error!("failed to remove mon service {}: {}", resource, e);
        }
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(e) = delete_if_exists(&pvcs, &resource, &DeleteParams::default()).await {
            error!("failed to remove mon pvc {}: {}", resource, e);
        }

        self.store
            .save(&self.info)
            .await
            .with_context(|| format!("failed to save mon config after removing mon {name}"))?;
        self.store.write_connection_config(&self.info, &self.ceph).await
    }

    /// Whether every mon except `name` is in quorum; an unreadable quorum counts as no
    async fn others_in_quorum(&self, name: &str) -> bool {
        match self.ceph.mon_quorum_status().await {
            Ok(status) => status
                .monmap
                .mons
                .iter()
                .filter(|m| m.name != name)
                .all(|m| status.in_quorum(&m.name)),
            Err(e) => {
                warn!("could not read the quorum before removing mon {}: {}", name, e);
                false
            }
        }
    }

    /// Gives up on `name`: removes it when there are more mons than desired and the rest are in
    /// quorum, else replaces it. Returns whether anything was attempted; a refused failover lets
    /// the caller look at other mons.
    pub async fn fail_mon(&mut self, mon_count: usize, desired: usize, name: &str) -> bool {
        if mon_count > desired {
            if self.others_in_quorum(name).await {
                if let Err(e) = self.remove_mon(name).await {
                    error!("failed to remove mon {}: {}", name, e);
                }
                return true;
            }
            info!("not shrinking to {} mons while others are out of quorum, replacing mon {} instead", desired, name);
        }

        if let Err(e) = self.allow_failover(name).await {
            warn!("aborting failover of mon {}: {}", name, e);
            return false;
        }

        let pdbs = match PdbClient::detect(self.client.clone(), &self.namespace, self.owner.clone()).await {
            Ok(pdbs) => Some(pdbs),
            Err(e) => {
                error!("failed to detect the disruption budget api: {}", e);
                None
            }
        };
        if let Some(pdbs) = &pdbs {
            if let Err(e) = block_mon_drain(pdbs).await {
                error!("failed to block mon drains: {}", e);
            }
        }
        if let Err(e) = self.failover_mon(name).await {
            error!("failed to fail over mon {}: {}", name, e);
        }
        if let Some(pdbs) = &pdbs {
            if let Err(e) = allow_mon_drain(pdbs).await {
                error!("failed to allow mon drains: {}", e);
            }
        }
        true
    }

    /// Old releases cannot replace the arbiter of a stretch cluster
    async fn allow_failover(&self, name: &str) -> Result<()> {
        let Some(arbiter_zone) = self.cluster.arbiter_zone() else {
            return Ok(());
        };
        let nodes = self.list_nodes().await?;
        let zones = mon_zones(&self.info.mapping, &nodes, self.zone_label());
        if arbiter_mon(&zones, arbiter_zone).as_deref() != Some(name) {
            return Ok(());
        }
        let version = match self.info.ceph_version {
            Some(version) => version,
            None => self.ceph.mon_version().await?,
        };
        if version.is_at_least(&ARBITER_FAILOVER_VERSION) {
            return Ok(());
        }
        Err(Error::Invalid(format!(
            "refusing to fail over arbiter mon {name} before ceph {ARBITER_FAILOVER_VERSION}, running {version}"
        )))
    }

    /// Starts a replacement for `name` under the next mon id, then removes `name`. On failure
    /// the old mon is scaled back up and the replacement and its id are given up.
    pub async fn failover_mon(&mut self, name: &str) -> Result<()> {
        info!("failing over mon {}", name);
        let nodes = self.list_nodes().await?;
        let mut zones = mon_zones(&self.info.mapping, &nodes, self.zone_label());
        zones.remove(name);
        let zone = zone_for_new_mon(self.cluster.spec.mon.stretch_cluster.as_ref(), &zones)?;

        let previous_max = self.info.max_mon_id;
        let mut mon = MonConfig::new(&index_to_name(previous_max + 1), DEFAULT_MON_PORT);
        mon.zone = zone;
        if self.cluster.spec.mon.volume_claim_template.is_some() {
            mon.pvc_name = Some(mon.resource_name.clone());
        }
        info!("starting new mon {} to replace {}", mon.daemon_id, name);

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let old = Self::resource_name(name);
        if let Err(e) = scale_deployment(&deployments, &old, 0).await {
            warn!("failed to stop mon {} for failover: {}", name, e);
        }

        let mut started = false;
        if let Err(e) = self.start_replacement(&mut mon, &nodes, &mut started).await {
            warn!("failover of mon {} unsuccessful, cleaning up replacement mon {}", name, mon.daemon_id);
            if let Err(err) = scale_deployment(&deployments, &old, 1).await {
                warn!("failed to restart mon {} after the failed failover: {}", name, err);
            }
            if let Err(err) = self.remove_mon_with_optional_quorum(&mon.daemon_id, started).await {
                info!("failed to remove replacement mon {}: {}", mon.daemon_id, err);
            }
            info!("reverting maxMonId to {}", previous_max);
            self.info.max_mon_id = previous_max;
            if let Err(err) = self.store.save(&self.info).await {
                error!("failed to revert maxMonId after starting mon {}: {}", mon.daemon_id, err);
            }
            return Err(e);
        }

        if let (Some(arbiter), Some(zone)) = (self.cluster.arbiter_zone(), mon.zone.as_deref()) {
            if arbiter == zone {
                self.ceph.mon_set_tiebreaker(&mon.daemon_id).await?;
            }
        }
        self.remove_mon(name).await
    }

    async fn start_replacement(&mut self, mon: &mut MonConfig, nodes: &[Node], started: &mut bool) -> Result<()> {
        let mon_pods = self.list_mon_pods().await?;
        self.assign(std::slice::from_mut(mon), nodes, &mon_pods)?;
        self.init_mon_ip(mon).await?;
        self.info
            .monitors
            .insert(mon.daemon_id.clone(), MonInfo::new(&mon.daemon_id, &mon.public_ip, mon.port));

        // committed before the daemon starts so a crash never hands the id out twice
        let index = name_to_index(&mon.daemon_id)?;
        self.store.commit_max_mon_id(&mut self.info, index, true).await?;
        self.store.write_connection_config(&self.info, &self.ceph).await?;

        *started = true;
        self.start_mon(mon).await?;
        self.wait_for_quorum(std::slice::from_ref(&mon.daemon_id)).await
    }

    /// Deletes mon PVCs whose deployment is gone
    pub async fn remove_orphan_pvcs(&self) {
        if self.cluster.spec.mon.volume_claim_template.is_none() {
            return;
        }
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &self.namespace);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let claims = match pvcs.list(&ListParams::default().labels(&format!("app={MON_APP}"))).await {
            Ok(list) => list.items,
            Err(e) => {
                info!("failed to check for orphaned mon pvcs: {}", e);
                return;
            }
        };
        for claim in claims {
            let name = claim.name_any();
            match get_opt(&deployments, &name).await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    info!("removing pvc {} since no mon uses it", name);
                    if let Err(e) = delete_if_exists(&pvcs, &name, &delete_now()).await {
                        warn!("failed to delete orphaned mon pvc {}: {}", name, e);
                    }
                }
                Err(e) => info!("keeping pvc {} since mon {} might still need it: {}", name, name, e),
            }
        }
    }

    /// Deletes the deployments that probed where a mon could schedule
    pub async fn remove_canaries(&self) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!("app={MON_APP},{MON_CANARY_LABEL}");
        let canaries = deployments
            .list(&ListParams::default().labels(&selector))
            .await
            .context("failed to list mon canaries")?;
        for canary in canaries {
            delete_if_exists(&deployments, &canary.name_any(), &delete_now()).await?;
        }
        Ok(())
    }
}
