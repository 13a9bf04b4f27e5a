use chrono::{DateTime, Utc};
use kube::{
    client::Client,
    runtime::{
        controller::Action,
        events::{Recorder, Reporter},
    },
    Api, Resource, ResourceExt,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    ceph::{CephClient, CephConnection, CommandExecutor, ProcessExecutor},
    controllers::{
        disruption::{crush_cache::OsdCrushLocationCache, ClusterMap},
        mon::health::HealthCheckers,
    },
    reporting::{blocked_condition_type, report_outcome, EventDebouncer, Phase, ReconcileOutcome, Reported},
    util::{
        config::OperatorConfig,
        errors::{ErrorKind, Result},
        lock::OrchestrationLocks,
        metrics::Metrics,
    },
};

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    metrics: Metrics,
    config: OperatorConfig,
    executor: Arc<dyn CommandExecutor>,
    locks: OrchestrationLocks,
    crush_cache: OsdCrushLocationCache,
    clusters: ClusterMap,
    health_checkers: HealthCheckers,
    events: EventDebouncer,
    cancel: CancellationToken,
    cluster_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_config(OperatorConfig::from_env(), Arc::new(ProcessExecutor))
    }

    pub fn with_config(config: OperatorConfig, executor: Arc<dyn CommandExecutor>) -> Result<Self, prometheus::Error> {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::new()?.register(&registry)?;
        Ok(Self {
            diagnostics: Arc::default(),
            registry,
            metrics,
            executor,
            locks: OrchestrationLocks::default(),
            crush_cache: OsdCrushLocationCache::default(),
            clusters: ClusterMap::default(),
            health_checkers: HealthCheckers::default(),
            events: EventDebouncer::new(config.event_debounce),
            cancel: CancellationToken::new(),
            cluster_tokens: Arc::default(),
            config,
        })
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Cancels every command, retry loop and health checker
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
            config: self.config.clone(),
            executor: self.executor.clone(),
            locks: self.locks.clone(),
            crush_cache: self.crush_cache.clone(),
            clusters: self.clusters.clone(),
            health_checkers: self.health_checkers.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            cluster_tokens: self.cluster_tokens.clone(),
        })
    }
}

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    pub config: OperatorConfig,
    pub executor: Arc<dyn CommandExecutor>,
    pub locks: OrchestrationLocks,
    pub crush_cache: OsdCrushLocationCache,
    pub clusters: ClusterMap,
    /// One mon health checker per cluster
    pub health_checkers: HealthCheckers,
    pub events: EventDebouncer,
    /// Operator wide; every cluster gets a child token
    pub cancel: CancellationToken,
    cluster_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Context {
    /// Cancellation scope of one cluster, cancelled when the cluster is deleted
    pub fn cluster_token(&self, namespace: &str) -> CancellationToken {
        let mut tokens = self.cluster_tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .entry(namespace.to_string())
            .or_insert_with(|| self.cancel.child_token())
            .clone()
    }

    pub fn cancel_cluster(&self, namespace: &str) {
        let mut tokens = self.cluster_tokens.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = tokens.remove(namespace) {
            info!("cancelling in-flight operations of cluster {}", namespace);
            token.cancel();
        }
    }

    /// Admin command runner for the cluster in `namespace`
    pub fn ceph_client(&self, namespace: &str) -> CephClient {
        CephClient::new(
            self.executor.clone(),
            CephConnection::for_cluster(namespace, &self.config.data_dir),
            self.config.command_timeout,
            self.cluster_token(namespace),
        )
    }

    pub async fn recorder(&self) -> Recorder {
        self.diagnostics.read().await.recorder(self.client.clone())
    }

    /// Stamps the diagnostics of `controller`
    pub async fn record_event(&self, controller: &str) {
        let mut diagnostics = self.diagnostics.write().await;
        let now = Utc::now();
        diagnostics.last_event = now;
        diagnostics.controllers.insert(controller.to_string(), now);
    }

    /// Writes the outcome of a reconcile to the status of `obj` and publishes an event.
    ///
    /// Transient failures are handed back to the runtime so `error_policy` requeues them;
    /// everything else becomes the action the outcome calls for.
    pub async fn report<K>(&self, obj: &K, result: Result<Action>, success_phase: Phase) -> Result<Action>
    where
        K: Reported + Resource<Scope = kube::core::NamespaceResourceScope>,
    {
        let blocked = blocked_condition_type(&K::kind(&()));
        let outcome = ReconcileOutcome::from_result(&result, success_phase, blocked);
        if let Some(ns) = obj.namespace() {
            let api: Api<K> = Api::namespaced(self.client.clone(), &ns);
            if let Err(e) = report_outcome(&api, obj, &outcome, self.config.status_update_retries).await {
                warn!("failed to report status of {} '{}': {}", K::kind(&()), obj.name_any(), e);
            }
        }
        let recorder = self.recorder().await;
        self.events.publish(&recorder, &obj.object_ref(&()), &outcome).await;

        match result {
            Err(e) if e.kind() == ErrorKind::Transient => Err(e),
            Err(e) => {
                self.metrics.reconcile_failure(obj, &e);
                Ok(outcome.action)
            }
            Ok(action) => Ok(action),
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    /// Last reconcile per controller
    pub controllers: BTreeMap<String, DateTime<Utc>>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            controllers: BTreeMap::new(),
            reporter: "ceph-operator".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceph::testing::MockExecutor;

    #[tokio::test]
    async fn cluster_tokens_are_children_of_the_operator_token() {
        let (client, _server) = crate::tests::mock_client();
        let ctx = testing::context(client, &MockExecutor::new());
        let first = ctx.cluster_token("rook-ceph");
        let other = ctx.cluster_token("other");

        ctx.cancel_cluster("rook-ceph");
        assert!(first.is_cancelled());
        assert!(!other.is_cancelled());
        // a recreated cluster starts with a fresh token
        assert!(!ctx.cluster_token("rook-ceph").is_cancelled());

        ctx.cancel.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn cluster_cancellation_reaches_every_controller() {
        let (client, _server) = crate::tests::mock_client();
        let data_dir = std::env::temp_dir().join(format!("ceph-operator-{}", uuid::Uuid::new_v4()));
        let config = OperatorConfig {
            data_dir: data_dir.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let state = State::with_config(config, Arc::new(MockExecutor::new())).unwrap();
        let clusters = state.to_context(client.clone());
        let scripts = state.to_context(client);

        let in_flight = scripts.cluster_token("rook-ceph");
        assert!(!in_flight.is_cancelled());
        clusters.cancel_cluster("rook-ceph");
        assert!(in_flight.is_cancelled());
        // the event window is shared as well
        assert!(clusters.events.should_emit("CephLuaScript/rook-ceph/pre", "Invalid"));
        assert!(!scripts.events.should_emit("CephLuaScript/rook-ceph/pre", "Invalid"));
    }

    #[tokio::test]
    async fn diagnostics_track_each_controller() {
        let (client, _server) = crate::tests::mock_client();
        let ctx = testing::context(client, &MockExecutor::new());
        ctx.record_event("cephcluster").await;
        ctx.record_event("cephluascript").await;
        let diagnostics = ctx.diagnostics.read().await.clone();
        assert_eq!(diagnostics.controllers.len(), 2);
    }
}
