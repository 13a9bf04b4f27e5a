use crate::util::errors::Error;
use kube::{Resource, ResourceExt};
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["instance"],
        )?;
        let failures = IntCounterVec::new(
            opts!("controller_reconciliation_errors_total", "reconciliation errors",),
            &["instance", "error"],
        )?;
        let reconciliations = IntCounter::new("reconciliations_total", "reconciliations")?;
        Ok(Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        })
    }

    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    /// Counts a failed reconcile of `obj`, labelled `<kind>/<name>`
    pub fn reconcile_failure<K>(&self, obj: &K, e: &Error)
    where
        K: Resource<DynamicType = ()>,
    {
        let instance = format!("{}/{}", K::kind(&()), obj.name_any());
        self.failures
            .with_label_values(&[instance.as_str(), e.metric_label().as_str()])
            .inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            instance: controller.to_string(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    instance: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.instance.as_str()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::luascript::{CephLuaScript, CephLuaScriptSpec};

    #[test]
    fn failures_are_labelled_by_kind_and_error() {
        let registry = Registry::new();
        let metrics = Metrics::new().unwrap().register(&registry).unwrap();
        let script = CephLuaScript::new("pre", CephLuaScriptSpec::default());
        metrics.reconcile_failure(&script, &Error::Invalid("no source".into()));
        {
            let _timer = metrics.count_and_measure("lua_script");
        }

        let families = registry.gather();
        let failures = families
            .iter()
            .find(|f| f.get_name() == "controller_reconciliation_errors_total")
            .unwrap();
        let labels: Vec<_> = failures.get_metric()[0]
            .get_label()
            .iter()
            .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
            .collect();
        assert!(labels.contains(&("instance".to_string(), "CephLuaScript/pre".to_string())));
        assert!(labels.contains(&("error".to_string(), "invalid".to_string())));
        assert_eq!(metrics.reconciliations.get(), 1);
    }
}
