use prometheus::{
    histogram_opts, opts, Encoder, Gauge, Histogram, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};
use std::time::Instant;
use tracing::debug;

use crate::error::{FaucetError, FaucetResult, QuotaLimit};

/// Request outcome labels
pub const OUTCOMES: [&str; 7] = [
    "success",
    "pending",
    "denied_total",
    "denied_address",
    "rejected",
    "unavailable",
    "invalid",
];

/// Prometheus metrics for the faucet
pub struct FaucetMetrics {
    registry: Registry,

    /// Funding requests by outcome
    pub requests_total: IntCounterVec,
    /// Amount held or disbursed, in whole currency units
    pub global_total: Gauge,
    /// Reservations waiting for reconciliation
    pub unresolved_reservations: IntGauge,
    /// Time from signing to final submit outcome
    pub submission_duration: Histogram,
    /// Reservations settled by the reconciler, by action
    pub reconciled_total: IntCounterVec,
}

impl FaucetMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            opts!("faucet_requests_total", "Funding requests by outcome"),
            &["outcome"],
        )?;

        let global_total = Gauge::with_opts(opts!(
            "faucet_global_total",
            "Amount held or disbursed across all addresses"
        ))?;

        let unresolved_reservations = IntGauge::with_opts(opts!(
            "faucet_unresolved_reservations",
            "Reservations whose submission outcome is unknown"
        ))?;

        let submission_duration = Histogram::with_opts(histogram_opts!(
            "faucet_submission_duration_seconds",
            "Time spent submitting and confirming transfers",
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        ))?;

        let reconciled_total = IntCounterVec::new(
            opts!("faucet_reconciled_total", "Reservations settled by reconciliation"),
            &["action"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(global_total.clone()))?;
        registry.register(Box::new(unresolved_reservations.clone()))?;
        registry.register(Box::new(submission_duration.clone()))?;
        registry.register(Box::new(reconciled_total.clone()))?;

        // pre-create every label so the series show up as zero
        for outcome in OUTCOMES {
            requests_total.with_label_values(&[outcome]);
        }
        for action in ["committed", "released"] {
            reconciled_total.with_label_values(&[action]);
        }

        Ok(Self {
            registry,
            requests_total,
            global_total,
            unresolved_reservations,
            submission_duration,
            reconciled_total,
        })
    }

    /// Count a finished request under its outcome label
    pub fn record_outcome<T>(&self, result: &FaucetResult<T>, pending: impl Fn(&T) -> bool) {
        let outcome = match result {
            Ok(value) if pending(value) => "pending",
            Ok(_) => "success",
            Err(FaucetError::QuotaDenied(QuotaLimit::TotalLimit)) => "denied_total",
            Err(FaucetError::QuotaDenied(QuotaLimit::AddressLimit)) => "denied_address",
            Err(FaucetError::InvalidAddress(_)) | Err(FaucetError::InvalidRequest(_)) => "invalid",
            Err(FaucetError::SubmissionRejected(_)) => "rejected",
            Err(_) => "unavailable",
        };
        self.requests_total.with_label_values(&[outcome]).inc();
    }

    pub fn requests(&self, outcome: &str) -> u64 {
        self.requests_total.with_label_values(&[outcome]).get()
    }

    pub fn record_reconciled(&self, committed: usize, released: usize) {
        self.reconciled_total
            .with_label_values(&["committed"])
            .inc_by(committed as u64);
        self.reconciled_total
            .with_label_values(&["released"])
            .inc_by(released as u64);
    }

    /// Update the global total gauge from a base-unit amount
    pub fn set_global_total(&self, base_units: u128, decimals: u32) {
        let whole = base_units as f64 / 10f64.powi(decimals as i32);
        self.global_total.set(whole);
    }

    pub fn start_submission(&self) -> SubmissionTimer<'_> {
        SubmissionTimer {
            start: Instant::now(),
            histogram: &self.submission_duration,
        }
    }

    /// Text exposition of every registered metric
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Records elapsed submission time when finished
pub struct SubmissionTimer<'a> {
    start: Instant,
    histogram: &'a Histogram,
}

impl SubmissionTimer<'_> {
    pub fn finish(self) {
        let elapsed = self.start.elapsed();
        self.histogram.observe(elapsed.as_secs_f64());
        debug!("Submission finished in {:?}", elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        let metrics = FaucetMetrics::new().unwrap();
        metrics.record_outcome(&Ok::<bool, FaucetError>(false), |p| *p);
        metrics.record_outcome(&Ok::<bool, FaucetError>(true), |p| *p);
        metrics.record_outcome::<bool>(
            &Err(FaucetError::QuotaDenied(QuotaLimit::AddressLimit)),
            |p| *p,
        );
        metrics.record_outcome::<bool>(
            &Err(FaucetError::ChainUnavailable("down".into())),
            |p| *p,
        );

        assert_eq!(metrics.requests("success"), 1);
        assert_eq!(metrics.requests("pending"), 1);
        assert_eq!(metrics.requests("denied_address"), 1);
        assert_eq!(metrics.requests("unavailable"), 1);
        assert_eq!(metrics.requests("denied_total"), 0);
    }

    #[test]
    fn test_gather_exposes_series() {
        let metrics = FaucetMetrics::new().unwrap();
        metrics.set_global_total(60 * 10u128.pow(18), 18);
        metrics.record_reconciled(2, 1);
        metrics.start_submission().finish();

        let text = metrics.gather().unwrap();
        assert!(text.contains("faucet_global_total 60"));
        assert!(text.contains("faucet_reconciled_total{action=\"committed\"} 2"));
        assert!(text.contains("faucet_requests_total{outcome=\"invalid\"} 0"));
        assert!(text.contains("faucet_submission_duration_seconds_count 1"));
    }
}
