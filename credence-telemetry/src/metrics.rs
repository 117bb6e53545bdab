//! ## credence-telemetry::metrics
//! **Prometheus registry for tracker state**

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub total_token_amount: IntGauge,
    pub tracked_nodes: IntGauge,
    pub callbacks_fired: IntCounter,
    pub persist_failures: IntCounter,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    /// Builds a recorder with its own registry so several trackers can coexist
    /// in one process.
    pub fn new() -> Self {
        let registry = Registry::new();
        let total_token_amount = IntGauge::new(
            "credence_total_token_amount",
            "Sum of positive balances of tracked nodes",
        )
        .expect("static metric definition");
        let tracked_nodes = IntGauge::new("credence_tracked_nodes", "Number of tracked nodes")
            .expect("static metric definition");
        let callbacks_fired = IntCounter::new(
            "credence_callbacks_fired_total",
            "Balance threshold callbacks fired",
        )
        .expect("static metric definition");
        let persist_failures = IntCounter::new(
            "credence_persist_failures_total",
            "Failed reads and writes against the balance store",
        )
        .expect("static metric definition");

        for collector in [
            Box::new(total_token_amount.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(tracked_nodes.clone()),
            Box::new(callbacks_fired.clone()),
            Box::new(persist_failures.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric names are unique within a fresh registry");
        }

        Self {
            registry,
            total_token_amount,
            tracked_nodes,
            callbacks_fired,
            persist_failures,
        }
    }

    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Gauges are i64; amounts above `i64::MAX` are reported saturated.
    pub fn set_total_token_amount(&self, amount: u64) {
        self.total_token_amount
            .set(i64::try_from(amount).unwrap_or(i64::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_metrics() {
        let metrics = MetricsRecorder::new();
        metrics.set_total_token_amount(1234);
        metrics.tracked_nodes.inc();
        metrics.callbacks_fired.inc();
        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("credence_total_token_amount 1234"));
        assert!(text.contains("credence_tracked_nodes 1"));
        assert!(text.contains("credence_callbacks_fired_total 1"));
    }

    #[test]
    fn saturates_huge_totals() {
        let metrics = MetricsRecorder::new();
        metrics.set_total_token_amount(u64::MAX);
        assert_eq!(metrics.total_token_amount.get(), i64::MAX);
    }
}
