use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::model::{MaskOutcome, StoreKind};

/// Aggregate counters for one store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreTotals {
    pub attempted: u64,
    pub succeeded: u64,
    pub noops: u64,
    pub expected_limitations: u64,
    pub failures: u64,
    /// Documents/rows actually touched, where the store reports a count.
    pub records_touched: u64,
}

impl StoreTotals {
    fn record(&mut self, outcome: &MaskOutcome) {
        self.attempted += 1;
        match outcome {
            MaskOutcome::Success(n) => {
                self.succeeded += 1;
                self.records_touched += n;
            }
            MaskOutcome::Noop => self.noops += 1,
            MaskOutcome::ExpectedLimitation(_) => self.expected_limitations += 1,
            MaskOutcome::Failure(_) => self.failures += 1,
        }
    }
}

/// Per-phase sub-totals reported alongside the store totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTotals {
    pub operations: u64,
    pub failures: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
struct Inner {
    relational: StoreTotals,
    search: StoreTotals,
    analytics: StoreTotals,
    fallback_sweep: PhaseTotals,
    targeted_sweep: PhaseTotals,
    discovery_sweep: PhaseTotals,
    verification_residuals: u64,
    subjects_total: u64,
    #[serde(with = "humantime_serde")]
    elapsed: Duration,
}

/// Run-wide counters. This is the only state mutated by concurrent workers;
/// every increment goes through the mutex, never a raw field.
#[derive(Debug, Default)]
pub struct RunStats {
    inner: Mutex<Inner>,
}

impl RunStats {
    pub fn new(subjects_total: u64) -> Self {
        let stats = Self::default();
        stats.inner.lock().unwrap().subjects_total = subjects_total;
        stats
    }

    pub fn record(&self, store: StoreKind, outcome: &MaskOutcome) {
        let mut inner = self.inner.lock().unwrap();
        match store {
            StoreKind::Relational => inner.relational.record(outcome),
            StoreKind::Search => inner.search.record(outcome),
            StoreKind::Analytics => inner.analytics.record(outcome),
        }
    }

    pub fn record_phase(&self, phase: Phase, outcome: &MaskOutcome) {
        let mut inner = self.inner.lock().unwrap();
        let totals = match phase {
            Phase::FallbackSweep => &mut inner.fallback_sweep,
            Phase::TargetedSweep => &mut inner.targeted_sweep,
            Phase::DiscoverySweep => &mut inner.discovery_sweep,
        };
        totals.operations += 1;
        if let MaskOutcome::Failure(_) = outcome {
            totals.failures += 1;
        }
    }

    pub fn record_residuals(&self, hits: u64) {
        self.inner.lock().unwrap().verification_residuals += hits;
    }

    pub fn set_elapsed(&self, elapsed: Duration) {
        self.inner.lock().unwrap().elapsed = elapsed;
    }

    pub fn store_totals(&self, store: StoreKind) -> StoreTotals {
        let inner = self.inner.lock().unwrap();
        match store {
            StoreKind::Relational => inner.relational,
            StoreKind::Search => inner.search,
            StoreKind::Analytics => inner.analytics,
        }
    }

    pub fn phase_totals(&self, phase: Phase) -> PhaseTotals {
        let inner = self.inner.lock().unwrap();
        match phase {
            Phase::FallbackSweep => inner.fallback_sweep,
            Phase::TargetedSweep => inner.targeted_sweep,
            Phase::DiscoverySweep => inner.discovery_sweep,
        }
    }

    /// Render the final run summary, the sole artifact handed to reporting.
    pub fn summary(&self) -> String {
        let inner = self.inner.lock().unwrap();
        serde_json::to_string_pretty(&*inner).unwrap_or_else(|_| String::from("{}"))
    }

    pub fn total_failures(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.relational.failures + inner.search.failures + inner.analytics.failures
    }
}

/// Masking phases that report sub-totals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    FallbackSweep,
    TargetedSweep,
    DiscoverySweep,
}
