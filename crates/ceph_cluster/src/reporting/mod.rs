//! Turns reconcile results into status phases, conditions and events.

mod events;

pub use events::{object_key, EventDebouncer};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::controller::Action,
    Resource, ResourceExt,
};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use std::{fmt, fmt::Debug};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::{
    api::v1::{
        cephcluster::{CephCluster, CephClusterStatus},
        luascript::{CephLuaScript, CephLuaScriptStatus},
        notifications::{CephBucketNotification, CephBucketTopic, CephBucketTopicStatus},
        object::{CephObjectRealm, CephObjectZoneGroup},
        pools::{CephBlockPool, CephFilesystem, CephObjectStore},
        GenericStatus,
    },
    util::{
        errors::{Error, ErrorKind, Result, TRANSIENT_REQUEUE},
        k8s::is_conflict,
        status::{condition, remove_status_condition, set_status_condition},
    },
};

pub const READY_CONDITION: &str = "Ready";
pub const PROGRESSING_CONDITION: &str = "Progressing";
pub const DELETION_IS_BLOCKED_CONDITION: &str = "DeletionIsBlocked";
pub const POOL_DELETION_IS_BLOCKED_CONDITION: &str = "PoolDeletionIsBlocked";
pub const OBJECT_STORE_DELETION_IS_BLOCKED_CONDITION: &str = "ObjectStoreDeletionIsBlocked";
pub const DEPENDENCY_MISSING_CONDITION: &str = "DependencyMissing";

pub const SUCCESS_REASON: &str = "ReconcileSucceeded";
pub const FAILURE_REASON: &str = "ReconcileFailed";

/// Base delay between status writes that lost an optimistic concurrency race
const CONFLICT_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Progressing,
    Ready,
    Failed,
    Deleting,
    /// External clusters the operator only connects to
    Connected,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::Progressing => write!(f, "Progressing"),
            Phase::Ready => write!(f, "Ready"),
            Phase::Failed => write!(f, "Failed"),
            Phase::Deleting => write!(f, "Deleting"),
            Phase::Connected => write!(f, "Connected"),
        }
    }
}

/// Condition a kind reports while its deletion waits for dependents
pub fn blocked_condition_type(kind: &str) -> &'static str {
    match kind {
        "CephBlockPool" => POOL_DELETION_IS_BLOCKED_CONDITION,
        "CephObjectStore" => OBJECT_STORE_DELETION_IS_BLOCKED_CONDITION,
        _ => DELETION_IS_BLOCKED_CONDITION,
    }
}

/// Common fields of every status this operator writes
pub trait ReportedStatus: Default + Clone + PartialEq + Serialize + Debug {
    fn phase(&self) -> Option<&str>;
    fn set_phase(&mut self, phase: Phase);
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn set_observed_generation(&mut self, generation: Option<i64>);
}

macro_rules! reported_status {
    ($($status:ty),*) => {$(
        impl ReportedStatus for $status {
            fn phase(&self) -> Option<&str> {
                self.phase.as_deref()
            }
            fn set_phase(&mut self, phase: Phase) {
                self.phase = Some(phase.to_string());
            }
            fn conditions_mut(&mut self) -> &mut Vec<Condition> {
                &mut self.conditions
            }
            fn set_observed_generation(&mut self, generation: Option<i64>) {
                self.observed_generation = generation;
            }
        }
    )*};
}

reported_status!(GenericStatus, CephClusterStatus, CephLuaScriptStatus, CephBucketTopicStatus);

/// A custom resource whose status the reporter owns
pub trait Reported: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug {
    type Status: ReportedStatus;
    fn status_mut(&mut self) -> &mut Option<Self::Status>;
}

macro_rules! reported {
    ($($kind:ty => $status:ty),*) => {$(
        impl Reported for $kind {
            type Status = $status;
            fn status_mut(&mut self) -> &mut Option<$status> {
                &mut self.status
            }
        }
    )*};
}

reported!(
    CephCluster => CephClusterStatus,
    CephBlockPool => GenericStatus,
    CephFilesystem => GenericStatus,
    CephObjectStore => GenericStatus,
    CephObjectRealm => GenericStatus,
    CephObjectZoneGroup => GenericStatus,
    CephBucketTopic => CephBucketTopicStatus,
    CephBucketNotification => GenericStatus,
    CephLuaScript => CephLuaScriptStatus
);

/// What a reconcile result means for status and requeueing
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub kind: Option<ErrorKind>,
    /// `None` leaves the current phase in place
    pub phase: Option<Phase>,
    pub reason: String,
    pub message: String,
    pub action: Action,
    blocked_condition: &'static str,
}

impl ReconcileOutcome {
    /// Classifies a reconcile result. `success_phase` is the phase reported when it succeeded.
    pub fn from_result(result: &Result<Action>, success_phase: Phase, blocked_condition: &'static str) -> Self {
        let err = match result {
            Ok(action) => {
                return Self {
                    kind: None,
                    phase: Some(success_phase),
                    reason: SUCCESS_REASON.to_string(),
                    message: String::new(),
                    action: action.clone(),
                    blocked_condition,
                }
            }
            Err(e) => e,
        };
        let kind = err.kind();
        let (phase, action) = match kind {
            ErrorKind::Transient => (
                Some(Phase::Progressing),
                Action::requeue(err.requeue_after().unwrap_or(TRANSIENT_REQUEUE)),
            ),
            ErrorKind::DependencyMissing => (
                Some(Phase::Progressing),
                Action::requeue(err.requeue_after().unwrap_or(TRANSIENT_REQUEUE)),
            ),
            ErrorKind::BlockedByDependents => (None, Action::await_change()),
            ErrorKind::Invalid | ErrorKind::Fatal => (Some(Phase::Failed), Action::await_change()),
        };
        Self {
            kind: Some(kind),
            phase,
            reason: err.reason(),
            message: err.to_string(),
            action,
            blocked_condition,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind.is_none()
    }

    /// Writes phase and conditions into `status`
    pub fn apply<S: ReportedStatus>(&self, status: &mut S, generation: Option<i64>) {
        if let Some(phase) = self.phase {
            status.set_phase(phase);
        }
        let conditions = status.conditions_mut();
        match self.kind {
            None => {
                set_status_condition(conditions, condition(READY_CONDITION, true, &self.reason, "", generation));
                remove_status_condition(conditions, PROGRESSING_CONDITION);
                remove_status_condition(conditions, DEPENDENCY_MISSING_CONDITION);
                remove_status_condition(conditions, self.blocked_condition);
                status.set_observed_generation(generation);
            }
            Some(ErrorKind::Transient) => {
                set_status_condition(
                    conditions,
                    condition(PROGRESSING_CONDITION, true, &self.reason, self.message.clone(), generation),
                );
            }
            Some(ErrorKind::DependencyMissing) => {
                set_status_condition(
                    conditions,
                    condition(DEPENDENCY_MISSING_CONDITION, true, &self.reason, self.message.clone(), generation),
                );
                set_status_condition(
                    conditions,
                    condition(READY_CONDITION, false, &self.reason, self.message.clone(), generation),
                );
            }
            Some(ErrorKind::BlockedByDependents) => {
                set_status_condition(
                    conditions,
                    condition(self.blocked_condition, true, "ObjectHasDependents", self.message.clone(), generation),
                );
            }
            Some(ErrorKind::Invalid) | Some(ErrorKind::Fatal) => {
                remove_status_condition(conditions, PROGRESSING_CONDITION);
                set_status_condition(
                    conditions,
                    condition(READY_CONDITION, false, &self.reason, self.message.clone(), generation),
                );
                status.set_observed_generation(generation);
            }
        }
    }
}

/// Read-modify-write of the status subresource. The write carries the resourceVersion that was
/// read, so a concurrent writer causes a 409 and another attempt with fresh state.
pub async fn update_status<K, F>(api: &Api<K>, name: &str, attempts: usize, mut mutate: F) -> Result<K>
where
    K: Reported,
    F: FnMut(&mut K::Status),
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        let mut obj = api.get_status(name).await?;
        let before = obj.status_mut().clone();
        let resource_version = obj.resource_version();
        let status = obj.status_mut().get_or_insert_with(Default::default);
        mutate(status);
        if before.as_ref() == Some(&*status) {
            debug!("status of {} '{}' unchanged", K::kind(&()), name);
            return Ok(obj);
        }

        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        match api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await {
            Ok(updated) => return Ok(updated),
            Err(e) if is_conflict(&e) && attempt < attempts => {
                let jitter = rand::thread_rng().gen_range(0..100);
                let wait = CONFLICT_BACKOFF * attempt as u32 + Duration::from_millis(jitter);
                debug!("status update of '{}' conflicted, retrying in {:?}", name, wait);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => {
                warn!("failed to update status of {} '{}': {}", K::kind(&()), name, e);
                return Err(Error::from(e));
            }
        }
    }
}

/// Records `outcome` on the status of `obj`
pub async fn report_outcome<K: Reported>(
    api: &Api<K>,
    obj: &K,
    outcome: &ReconcileOutcome,
    attempts: usize,
) -> Result<K> {
    let generation = obj.meta().generation;
    update_status(api, &obj.name_any(), attempts, |status| outcome.apply(status, generation)).await
}

/// Records a plain phase, e.g. `Deleting` before cleanup starts
pub async fn report_phase<K: Reported>(api: &Api<K>, obj: &K, phase: Phase, attempts: usize) -> Result<K> {
    update_status(api, &obj.name_any(), attempts, |status| status.set_phase(phase)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::v1::luascript::CephLuaScriptSpec,
        tests::{conflict, mock_client},
        util::{errors::StdError, status::find_status_condition},
    };
    use http::Method;

    fn transient() -> Error {
        Error::StdError(StdError::HttpError("connection reset".to_string()))
    }

    #[test]
    fn success_is_ready_and_clears_dependency() {
        let mut status = GenericStatus::default();
        let missing: Result<Action> = Err(Error::dependency("CephObjectStore store", "not ready"));
        let outcome = ReconcileOutcome::from_result(&missing, Phase::Ready, DELETION_IS_BLOCKED_CONDITION);
        assert_eq!(outcome.phase, Some(Phase::Progressing));
        assert_eq!(outcome.action, Action::requeue(Duration::from_secs(10)));
        outcome.apply(&mut status, Some(1));
        assert!(find_status_condition(&status.conditions, DEPENDENCY_MISSING_CONDITION).is_some());

        let ok: Result<Action> = Ok(Action::await_change());
        let outcome = ReconcileOutcome::from_result(&ok, Phase::Ready, DELETION_IS_BLOCKED_CONDITION);
        outcome.apply(&mut status, Some(2));
        assert_eq!(status.phase.as_deref(), Some("Ready"));
        assert_eq!(status.observed_generation, Some(2));
        assert!(find_status_condition(&status.conditions, DEPENDENCY_MISSING_CONDITION).is_none());
        assert_eq!(find_status_condition(&status.conditions, READY_CONDITION).unwrap().status, "True");
    }

    #[test]
    fn transient_errors_never_show_failed() {
        let mut status = GenericStatus {
            phase: Some("Ready".to_string()),
            ..Default::default()
        };
        let outcome = ReconcileOutcome::from_result(&Err(transient()), Phase::Ready, DELETION_IS_BLOCKED_CONDITION);
        assert_eq!(outcome.action, Action::requeue(TRANSIENT_REQUEUE));
        outcome.apply(&mut status, Some(1));
        assert_eq!(status.phase.as_deref(), Some("Progressing"));
        assert_eq!(status.observed_generation, None);
    }

    #[test]
    fn invalid_and_fatal_fail_without_requeue() {
        let invalid = ReconcileOutcome::from_result(
            &Err(Error::Invalid("no script".into())),
            Phase::Ready,
            DELETION_IS_BLOCKED_CONDITION,
        );
        assert_eq!(invalid.phase, Some(Phase::Failed));
        assert_eq!(invalid.action, Action::await_change());

        let fatal = ReconcileOutcome::from_result(
            &Err(Error::fatal("FsidMismatch", "fsid changed")),
            Phase::Ready,
            DELETION_IS_BLOCKED_CONDITION,
        );
        let mut status = GenericStatus::default();
        fatal.apply(&mut status, Some(3));
        let ready = find_status_condition(&status.conditions, READY_CONDITION).unwrap();
        assert_eq!(ready.reason, "FsidMismatch");
        assert_eq!(ready.status, "False");
    }

    #[test]
    fn blocked_deletion_sets_kind_specific_condition() {
        let blocked: Result<Action> = Err(Error::BlockedByDependents {
            blockers: vec!["CephBlockPool replicapool".into()],
        });
        let kind = blocked_condition_type("CephObjectStore");
        let outcome = ReconcileOutcome::from_result(&blocked, Phase::Ready, kind);
        let mut status = GenericStatus {
            phase: Some("Deleting".into()),
            ..Default::default()
        };
        outcome.apply(&mut status, None);
        assert_eq!(status.phase.as_deref(), Some("Deleting"));
        let cond = find_status_condition(&status.conditions, OBJECT_STORE_DELETION_IS_BLOCKED_CONDITION).unwrap();
        assert!(cond.message.contains("replicapool"));
        assert_eq!(blocked_condition_type("CephBlockPool"), POOL_DELETION_IS_BLOCKED_CONDITION);
        assert_eq!(blocked_condition_type("CephCluster"), DELETION_IS_BLOCKED_CONDITION);
    }

    #[tokio::test(start_paused = true)]
    async fn status_update_retries_conflicts() {
        let (client, mut server) = mock_client();
        let api: Api<CephLuaScript> = Api::namespaced(client, "rook-ceph");
        let path = "/apis/ceph.rook.io/v1/namespaces/rook-ceph/cephluascripts/pre/status";

        let mut script = CephLuaScript::new("pre", CephLuaScriptSpec::default());
        script.metadata.namespace = Some("rook-ceph".into());
        script.metadata.resource_version = Some("1".into());
        let fixture = serde_json::to_value(&script).unwrap();

        let updater = tokio::spawn(async move {
            update_status(&api, "pre", 3, |s| s.set_phase(Phase::Ready)).await
        });

        server.expect(Method::GET, path, 200, fixture.clone()).await;
        let first = server.expect(Method::PATCH, path, 409, conflict()).await;
        assert_eq!(first["metadata"]["resourceVersion"], "1");
        server.expect(Method::GET, path, 200, fixture.clone()).await;
        let mut updated = fixture;
        updated["status"] = json!({"phase": "Ready"});
        let second = server.expect(Method::PATCH, path, 200, updated).await;
        assert_eq!(second["status"]["phase"], "Ready");

        updater.await.unwrap().unwrap();
    }
}
