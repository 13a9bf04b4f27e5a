//! Periodic mon health check. Each tick compares the live quorum with the monitor map and takes
//! at most one corrective action: remove an unknown mon, replace a failed one, start missing
//! mons or remove a surplus one.

use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::*;

use super::{desired_mon_count, MonCluster};
use crate::{
    api::v1::cephcluster::CephCluster,
    ceph::status::MonStatusResponse,
    cluster_info::MonInfo,
    controllers::context::Context,
    util::{
        config::{parse_duration, OperatorConfig},
        errors::Result,
        telemetry,
    },
};

/// One corrective action, in the order a tick considers them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStep {
    /// In quorum but absent from the monitor map while the quorum is larger than desired
    RemoveUnknown(String),
    /// Out of quorum for longer than the timeout
    FailOver { name: String, mon_count: usize },
    /// In the monitor map but not in the monmap
    FailMissing { name: String, mon_count: usize },
    StartMons,
    RemoveExtra,
    RemoveCanaries,
    /// Two mons share a node; checked once per checker
    EvictSharedNode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthPlan {
    pub out_of_quorum: BTreeMap<String, DateTime<Utc>>,
    pub all_in_quorum: bool,
    pub steps: Vec<HealthStep>,
}

/// Decides what a tick does. `table` holds when each mon was first seen out of quorum; a
/// `timeout` of `None` never fails a mon over.
pub fn plan_health_action(
    truth: &BTreeMap<String, MonInfo>,
    status: &MonStatusResponse,
    desired: usize,
    table: &BTreeMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
    timeout: Option<chrono::Duration>,
    check_same_node: bool,
) -> HealthPlan {
    let mut out_of_quorum = table.clone();
    let mut steps = Vec::new();
    let live = status.monmap.mons.len();

    for mon in &status.monmap.mons {
        let in_quorum = status.quorum.contains(&mon.rank);
        if in_quorum {
            out_of_quorum.remove(&mon.name);
            if !truth.contains_key(&mon.name) && status.quorum.len() > desired {
                warn!("mon {} is in quorum but not in the monitor map, removing it", mon.name);
                return HealthPlan {
                    out_of_quorum,
                    all_in_quorum: false,
                    steps: vec![HealthStep::RemoveUnknown(mon.name.clone())],
                };
            }
            continue;
        }

        let since = *out_of_quorum.entry(mon.name.clone()).or_insert(now);
        warn!("mon {} not in quorum since {}", mon.name, since);
        match timeout {
            Some(timeout) if now - since >= timeout => {
                warn!("mon {} out of quorum for longer than {}, failing it", mon.name, timeout);
                steps.push(HealthStep::FailOver {
                    name: mon.name.clone(),
                    mon_count: live,
                });
            }
            Some(_) => {}
            None => debug!("mon failover is disabled"),
        }
    }

    let all_in_quorum = status.all_in_quorum();
    if all_in_quorum {
        out_of_quorum.clear();
    } else {
        out_of_quorum.retain(|name, _| status.monmap.mons.iter().any(|m| &m.name == name));
    }

    if let Some(name) = truth
        .keys()
        .find(|name| !status.monmap.mons.iter().any(|m| &m.name == *name))
    {
        warn!("mon {} is in the monitor map but not in the monmap", name);
        steps.push(HealthStep::FailMissing {
            name: name.clone(),
            mon_count: truth.len(),
        });
    }

    if live < desired {
        info!("{} of {} mons exist, starting the missing ones", live, desired);
        steps.push(HealthStep::StartMons);
    }

    if all_in_quorum && live > desired {
        if desired == 1 && live == 2 {
            info!("not removing a mon from two to one; reduce to one mon by hand if needed");
        } else {
            info!("{} mons exist but {} are desired, removing one", live, desired);
            steps.push(HealthStep::RemoveExtra);
        }
    }

    if all_in_quorum && live == desired {
        steps.push(HealthStep::RemoveCanaries);
        if check_same_node {
            steps.push(HealthStep::EvictSharedNode);
        }
    }

    HealthPlan {
        out_of_quorum,
        all_in_quorum,
        steps,
    }
}

/// Monitor map of an external cluster following its live quorum. `None` when nothing changed.
pub fn sync_external_monitors(
    truth: &BTreeMap<String, MonInfo>,
    status: &MonStatusResponse,
) -> Option<BTreeMap<String, MonInfo>> {
    let synced: BTreeMap<String, MonInfo> = status
        .monmap
        .mons
        .iter()
        .filter(|m| status.quorum.contains(&m.rank))
        .map(|m| {
            let info = truth.get(&m.name).cloned().unwrap_or_else(|| {
                info!("external mon {} joined the quorum", m.name);
                MonInfo {
                    name: m.name.clone(),
                    endpoint: m.endpoint(),
                }
            });
            (m.name.clone(), info)
        })
        .collect();
    (synced != *truth).then_some(synced)
}

/// Interval and failover timeout of one cluster. The cluster spec wins over the operator config;
/// a zero timeout disables failover.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSettings {
    pub disabled: bool,
    pub interval: Duration,
    pub timeout: Option<chrono::Duration>,
}

impl HealthSettings {
    pub fn new(cluster: &CephCluster, config: &OperatorConfig) -> Self {
        let spec = &cluster.spec.health_check.mon;
        let interval = spec
            .interval
            .as_deref()
            .and_then(parse_duration)
            .filter(|d| !d.is_zero())
            .unwrap_or(config.mon_health_interval);
        let timeout = spec
            .timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(config.mon_out_timeout);
        Self {
            disabled: spec.disabled,
            interval,
            timeout: (!timeout.is_zero())
                .then(|| chrono::Duration::from_std(timeout).ok())
                .flatten(),
        }
    }
}

/// Runs one health check against the loaded mons
pub async fn check_health(mons: &mut MonCluster, settings: &HealthSettings, checked_same_node: &mut bool) -> Result<()> {
    let status = mons.ceph().mon_quorum_status().await?;

    if mons.cluster().is_external() {
        if let Some(monitors) = sync_external_monitors(&mons.info.monitors, &status) {
            info!("external quorum changed, mons are now {:?}", monitors.keys());
            mons.info.monitors = monitors;
            mons.store().save(&mons.info).await?;
            mons.store().write_connection_config(&mons.info, mons.ceph()).await?;
        }
        return Ok(());
    }

    let desired = desired_mon_count(&mons.cluster().spec.mon)?;
    let plan = plan_health_action(
        &mons.info.monitors,
        &status,
        desired,
        &mons.info.out_of_quorum,
        Utc::now(),
        settings.timeout,
        !*checked_same_node,
    );
    debug!("mon health plan {:?}", plan.steps);
    if plan.out_of_quorum != mons.info.out_of_quorum {
        mons.info.out_of_quorum = plan.out_of_quorum.clone();
        mons.store().save(&mons.info).await?;
    }

    for step in plan.steps {
        let acted = match step {
            HealthStep::RemoveUnknown(name) => {
                mons.remove_mon(&name).await?;
                true
            }
            HealthStep::FailOver { name, mon_count } | HealthStep::FailMissing { name, mon_count } => {
                mons.fail_mon(mon_count, desired, &name).await
            }
            HealthStep::StartMons => {
                mons.start().await?;
                true
            }
            HealthStep::RemoveExtra => {
                mons.remove_extra_mon().await?;
                true
            }
            HealthStep::RemoveCanaries => {
                if let Err(e) = mons.remove_canaries().await {
                    warn!("failed to remove mon canaries: {}", e);
                }
                false
            }
            HealthStep::EvictSharedNode => {
                *checked_same_node = true;
                match mons.mon_to_evict().await? {
                    Some(name) => {
                        info!("mon {} shares a node with another mon, moving it", name);
                        mons.failover_mon(&name).await?;
                        true
                    }
                    None => false,
                }
            }
        };
        if acted {
            break;
        }
    }
    Ok(())
}

/// Background health check of one cluster
pub struct HealthChecker {
    ctx: Arc<Context>,
    namespace: String,
    checked_same_node: bool,
}

impl HealthChecker {
    pub fn new(ctx: Arc<Context>, namespace: &str) -> Self {
        Self {
            ctx,
            namespace: namespace.to_string(),
            checked_same_node: false,
        }
    }

    /// Ticks immediately, then once per interval until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("starting mon health checker of cluster {}", self.namespace);
        loop {
            let interval = match self.tick().await {
                Ok(interval) => interval,
                Err(e) => {
                    warn!("mon health check of cluster {} failed: {}", self.namespace, e);
                    self.ctx.config.mon_health_interval
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("stopped mon health checker of cluster {}", self.namespace);
    }

    #[instrument(skip(self), fields(trace_id, namespace = %self.namespace))]
    async fn tick(&mut self) -> Result<Duration> {
        let trace_id = telemetry::get_trace_id();
        Span::current().record("trace_id", field::display(&trace_id));

        let Some(cluster) = self.ctx.clusters.get(&self.namespace) else {
            debug!("cluster {} is not known yet", self.namespace);
            return Ok(self.ctx.config.mon_health_interval);
        };
        let settings = HealthSettings::new(&cluster, &self.ctx.config);
        if settings.disabled {
            debug!("mon health check of cluster {} is disabled", self.namespace);
            return Ok(settings.interval);
        }

        let _guard = self.ctx.locks.acquire(&self.namespace).await;
        let mut mons = MonCluster::load(self.ctx.client.clone(), self.ctx.ceph_client(&self.namespace), &cluster).await?;
        check_health(&mut mons, &settings, &mut self.checked_same_node).await?;
        Ok(settings.interval)
    }
}

/// Health checkers by cluster namespace, at most one live checker each
#[derive(Clone, Default)]
pub struct HealthCheckers {
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl HealthCheckers {
    /// Spawns the checker of `namespace` unless one is running. Returns whether one was started.
    pub fn start_once(&self, ctx: Arc<Context>, namespace: &str) -> bool {
        let cancel = ctx.cluster_token(namespace);
        {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if running.get(namespace).is_some_and(|t| !t.is_cancelled()) {
                return false;
            }
            running.insert(namespace.to_string(), cancel.clone());
        }
        let checker = HealthChecker::new(ctx, namespace);
        tokio::spawn(checker.run(cancel));
        true
    }

    pub fn stop(&self, namespace: &str) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = running.remove(namespace) {
            token.cancel();
        }
    }

    pub fn is_running(&self, namespace: &str) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.get(namespace).is_some_and(|t| !t.is_cancelled())
    }
}
