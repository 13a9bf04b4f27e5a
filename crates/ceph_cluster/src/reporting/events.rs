use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::time::{Duration, Instant};
use tracing::warn;

use super::{ReconcileOutcome, FAILURE_REASON, SUCCESS_REASON};

/// `<kind>/<namespace>/<name>`
pub fn object_key(reference: &ObjectReference) -> String {
    format!(
        "{}/{}/{}",
        reference.kind.as_deref().unwrap_or_default(),
        reference.namespace.as_deref().unwrap_or_default(),
        reference.name.as_deref().unwrap_or_default()
    )
}

/// Emits an event for an (object, reason) pair at most once per window
#[derive(Clone)]
pub struct EventDebouncer {
    window: Duration,
    last: Arc<Mutex<HashMap<(String, String), Instant>>>,
}

impl EventDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Arc::default(),
        }
    }

    /// Whether an event may be sent now; remembers the send when it may. Entries whose window
    /// has passed are dropped on every send.
    pub fn should_emit(&self, object: &str, reason: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let key = (object.to_string(), reason.to_string());
        if matches!(last.get(&key), Some(at) if now.duration_since(*at) < self.window) {
            return false;
        }
        last.retain(|_, at| now.duration_since(*at) < self.window);
        last.insert(key, now);
        true
    }

    pub fn len(&self) -> usize {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets a deleted object
    pub fn forget(&self, object: &str) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.retain(|(o, _), _| o != object);
    }

    /// Publishes `ReconcileSucceeded` or `ReconcileFailed` for `outcome` unless an event with the
    /// same outcome reason went out within the window. Failures to publish are only logged.
    pub async fn publish(&self, recorder: &Recorder, reference: &ObjectReference, outcome: &ReconcileOutcome) {
        let object = object_key(reference);
        let (type_, reason) = if outcome.is_success() {
            (EventType::Normal, SUCCESS_REASON)
        } else {
            (EventType::Warning, FAILURE_REASON)
        };
        if !self.should_emit(&object, &outcome.reason) {
            return;
        }
        let note = if outcome.is_success() {
            None
        } else {
            Some(format!("{}: {}", outcome.reason, outcome.message))
        };
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, reference).await {
            warn!("failed to publish event for {}: {}", object, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn repeats_are_suppressed_within_the_window() {
        let debouncer = EventDebouncer::new(Duration::from_secs(300));
        assert!(debouncer.should_emit("CephCluster/rook-ceph/rook-ceph", FAILURE_REASON));
        assert!(!debouncer.should_emit("CephCluster/rook-ceph/rook-ceph", FAILURE_REASON));
        // other reasons and objects are independent
        assert!(debouncer.should_emit("CephCluster/rook-ceph/rook-ceph", SUCCESS_REASON));
        assert!(debouncer.should_emit("CephLuaScript/rook-ceph/pre", FAILURE_REASON));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(debouncer.should_emit("CephCluster/rook-ceph/rook-ceph", FAILURE_REASON));
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_failure_cause_is_not_suppressed() {
        let debouncer = EventDebouncer::new(Duration::from_secs(300));
        let object = "CephBucketTopic/rook-ceph/orders";
        assert!(debouncer.should_emit(object, "Invalid"));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(debouncer.should_emit(object, "DependencyMissing"));
        assert!(!debouncer.should_emit(object, "DependencyMissing"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_evicted() {
        let debouncer = EventDebouncer::new(Duration::from_secs(300));
        for i in 0..10 {
            assert!(debouncer.should_emit(&format!("CephLuaScript/rook-ceph/s{i}"), SUCCESS_REASON));
        }
        assert_eq!(debouncer.len(), 10);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(debouncer.should_emit("CephLuaScript/rook-ceph/fresh", SUCCESS_REASON));
        assert_eq!(debouncer.len(), 1);
    }

    #[test]
    fn keys_name_kind_namespace_and_object() {
        let reference = ObjectReference {
            kind: Some("CephCluster".into()),
            namespace: Some("rook-ceph".into()),
            name: Some("my-cluster".into()),
            ..Default::default()
        };
        assert_eq!(object_key(&reference), "CephCluster/rook-ceph/my-cluster");
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_objects_emit_again() {
        let debouncer = EventDebouncer::new(Duration::from_secs(300));
        assert!(debouncer.should_emit("CephLuaScript/rook-ceph/pre", SUCCESS_REASON));
        debouncer.forget("CephLuaScript/rook-ceph/pre");
        assert!(debouncer.should_emit("CephLuaScript/rook-ceph/pre", SUCCESS_REASON));
    }
}
