//! Publishing limiter state for monitoring.

use prometheus::{register_int_gauge_vec_with_registry, IntGauge, IntGaugeVec, Registry};

use crate::LimiterState;

/// Receives the state of a [Limiter](crate::Limiter) after every change.
///
/// Called while the limiter's lock is held, so it must be cheap.
pub trait MetricsSink: Send + Sync {
    /// Record the latest state.
    fn publish(&self, state: LimiterState);
}

impl<F> MetricsSink for F
where
    F: Fn(LimiterState) + Send + Sync,
{
    fn publish(&self, state: LimiterState) {
        self(state)
    }
}

/// Prometheus gauges for the limit and usage of named limiters.
#[derive(Debug, Clone)]
pub struct AdmitMetrics {
    max: IntGaugeVec,
    used: IntGaugeVec,
}

impl AdmitMetrics {
    /// Register the gauges with `registry`. Fails if they are already registered.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            max: register_int_gauge_vec_with_registry!(
                "admit_max",
                "Current admission limit.",
                &["name"],
                registry,
            )?,
            used: register_int_gauge_vec_with_registry!(
                "admit_used",
                "Tokens currently in use.",
                &["name"],
                registry,
            )?,
        })
    }

    /// A sink for the limiter called `name`.
    pub fn sink(&self, name: &str) -> PrometheusSink {
        PrometheusSink {
            max: self.max.with_label_values(&[name]),
            used: self.used.with_label_values(&[name]),
        }
    }
}

/// Publishes one limiter's state to [AdmitMetrics] gauges.
#[derive(Debug, Clone)]
pub struct PrometheusSink {
    max: IntGauge,
    used: IntGauge,
}

impl MetricsSink for PrometheusSink {
    fn publish(&self, state: LimiterState) {
        self.max.set(gauge_value(state.limit()));
        self.used.set(gauge_value(state.in_flight()));
    }
}

fn gauge_value(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
