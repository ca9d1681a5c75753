use crate::error::{self, Result};

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};
use snafu::ResultExt;
use std::time::Instant;

const RESULT_LABEL: &str = "result";

/// Counts reconciliations by outcome and measures how long they take.
#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    reconciliations: IntCounterVec,
    duration: Histogram,
}

impl ReconcileMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let reconciliations = IntCounterVec::new(
            Opts::new(
                "quarantine_reconciliations_total",
                "Reconciliations of Quarantine objects, by result",
            ),
            &[RESULT_LABEL],
        )
        .context(error::MetricsRegistrationSnafu)?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(
                "quarantine_reconcile_duration_seconds",
                "Time taken to reconcile a Quarantine object",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )
        .context(error::MetricsRegistrationSnafu)?;

        registry
            .register(Box::new(reconciliations.clone()))
            .context(error::MetricsRegistrationSnafu)?;
        registry
            .register(Box::new(duration.clone()))
            .context(error::MetricsRegistrationSnafu)?;

        Ok(ReconcileMetrics {
            reconciliations,
            duration,
        })
    }

    pub fn observe(&self, result: &str, started: Instant) {
        self.reconciliations.with_label_values(&[result]).inc();
        self.duration.observe(started.elapsed().as_secs_f64());
    }
}
