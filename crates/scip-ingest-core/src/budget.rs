//! Size-based admission control for concurrently processed uploads.
//!
//! A [`BudgetController`] is created with the worker pool and shared between
//! its workers. Each in-flight upload is charged its compressed size; the
//! charge is returned when the upload leaves processing.
//!
//! Admission checks are advisory. Two workers may both observe enough
//! remaining budget and then both charge it, leaving the remaining value
//! negative for a while. Further admissions are refused until enough
//! charges are released.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Worst-case ratio between uncompressed and compressed index sizes, used
/// when an upload does not declare its uncompressed size.
pub const ESTIMATED_COMPRESSION_RATIO: i64 = 5;

#[derive(Debug)]
struct Inner {
    limit: i64,
    remaining: AtomicI64,
    in_flight_bytes: AtomicI64,
    in_flight_uncompressed_bytes: AtomicI64,
    active: AtomicI64,
}

/// Process-wide in-flight byte budget.
#[derive(Debug, Clone)]
pub struct BudgetController {
    inner: Arc<Inner>,
}

/// Point-in-time view of the resource-usage gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetGauges {
    pub remaining: Option<i64>,
    pub in_flight_bytes: i64,
    pub in_flight_uncompressed_bytes: i64,
    pub active: i64,
}

impl BudgetController {
    /// Creates a controller. A non-positive `limit` disables budgeting.
    pub fn new(limit: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit,
                remaining: AtomicI64::new(limit),
                in_flight_bytes: AtomicI64::new(0),
                in_flight_uncompressed_bytes: AtomicI64::new(0),
                active: AtomicI64::new(0),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.limit > 0
    }

    /// Remaining budget, or `None` when budgeting is disabled.
    pub fn remaining(&self) -> Option<i64> {
        self.is_enabled()
            .then(|| self.inner.remaining.load(Ordering::Acquire))
    }

    /// Read-only admission check for an upload of `candidate_size`
    /// compressed bytes.
    ///
    /// Refuses when the budget is exhausted, and when the candidate does not
    /// fit into what remains unless nothing is in flight, so an upload larger
    /// than the whole budget still runs on its own.
    pub fn try_admit(&self, candidate_size: i64) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let remaining = self.inner.remaining.load(Ordering::Acquire);
        if remaining <= 0 {
            return false;
        }
        candidate_size <= remaining || self.inner.active.load(Ordering::Acquire) == 0
    }

    /// Charges an upload entering processing.
    ///
    /// `uncompressed_size` feeds the uncompressed gauge only; when unknown it
    /// is estimated from the compressed size.
    pub fn charge(&self, compressed_size: i64, uncompressed_size: Option<i64>) -> BudgetCharge {
        let compressed = compressed_size.max(0);
        let uncompressed = uncompressed_size
            .unwrap_or(compressed.saturating_mul(ESTIMATED_COMPRESSION_RATIO))
            .max(0);

        if self.is_enabled() {
            self.inner.remaining.fetch_sub(compressed, Ordering::AcqRel);
        }
        self.inner.in_flight_bytes.fetch_add(compressed, Ordering::AcqRel);
        self.inner
            .in_flight_uncompressed_bytes
            .fetch_add(uncompressed, Ordering::AcqRel);
        self.inner.active.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(
            compressed,
            uncompressed,
            remaining = ?self.remaining(),
            "charged upload budget"
        );

        BudgetCharge {
            controller: self.clone(),
            compressed,
            uncompressed,
            released: false,
        }
    }

    pub fn gauges(&self) -> BudgetGauges {
        BudgetGauges {
            remaining: self.remaining(),
            in_flight_bytes: self.inner.in_flight_bytes.load(Ordering::Acquire),
            in_flight_uncompressed_bytes: self
                .inner
                .in_flight_uncompressed_bytes
                .load(Ordering::Acquire),
            active: self.inner.active.load(Ordering::Acquire),
        }
    }

    fn release(&self, compressed: i64, uncompressed: i64) {
        if self.is_enabled() {
            self.inner.remaining.fetch_add(compressed, Ordering::AcqRel);
        }
        self.inner.in_flight_bytes.fetch_sub(compressed, Ordering::AcqRel);
        self.inner
            .in_flight_uncompressed_bytes
            .fetch_sub(uncompressed, Ordering::AcqRel);
        self.inner.active.fetch_sub(1, Ordering::AcqRel);

        tracing::debug!(
            compressed,
            uncompressed,
            remaining = ?self.remaining(),
            "released upload budget"
        );
    }
}

/// Budget held by one in-flight upload. Released exactly once, either by
/// [`BudgetCharge::release`] or on drop.
#[derive(Debug)]
#[must_use = "dropping a charge releases it immediately"]
pub struct BudgetCharge {
    controller: BudgetController,
    compressed: i64,
    uncompressed: i64,
    released: bool,
}

impl BudgetCharge {
    pub fn compressed_size(&self) -> i64 {
        self.compressed
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.controller.release(self.compressed, self.uncompressed);
        }
    }
}

impl Drop for BudgetCharge {
    fn drop(&mut self) {
        self.release_once();
    }
}
