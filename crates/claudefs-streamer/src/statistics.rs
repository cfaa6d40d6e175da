//! Statistics reported by the scheduler and the processing stack.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Value of a statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatisticValue {
    /// Plain count.
    Integer(i64),
    /// Plain floating point value.
    Float(f64),
    /// Percentage in the range 0.0 to 100.0.
    Percentage(f64),
    /// Amount of memory or data.
    ByteSize(u64),
    /// Throughput.
    BytesPerSecond(f64),
    /// Time span.
    Duration(Duration),
}

/// A single named statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistic {
    /// Component that reported the value.
    pub owner: String,
    /// Name of the statistic.
    pub name: String,
    /// Current value.
    pub value: StatisticValue,
}

impl Statistic {
    /// Creates a statistic.
    pub fn new(owner: impl Into<String>, name: impl Into<String>, value: StatisticValue) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            value,
        }
    }

    /// Creates an integer statistic.
    pub fn integer(owner: &str, name: &str, value: i64) -> Self {
        Self::new(owner, name, StatisticValue::Integer(value))
    }

    /// Creates a percentage statistic from a ratio of two counters.
    pub fn percentage(owner: &str, name: &str, part: u64, total: u64) -> Self {
        let value = if total == 0 {
            0.0
        } else {
            part as f64 * 100.0 / total as f64
        };
        Self::new(owner, name, StatisticValue::Percentage(value))
    }
}

/// Finds a statistic by owner and name.
pub fn find<'a>(statistics: &'a [Statistic], owner: &str, name: &str) -> Option<&'a Statistic> {
    statistics
        .iter()
        .find(|statistic| statistic.owner == owner && statistic.name == name)
}

/// Counters kept by the scheduler.
///
/// Updated from the scheduler thread with relaxed atomics and read from any thread.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    requests_queued: AtomicU64,
    requests_prepared: AtomicU64,
    requests_dispatched: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    requests_canceled: AtomicU64,
    allocation_failures: AtomicU64,
    cancels_processed: AtomicU64,
    reschedules_processed: AtomicU64,
    flushes_processed: AtomicU64,
    schedule_passes: AtomicU64,
    schedule_time_ns: AtomicU64,
    max_prepared_depth: AtomicU64,
    max_in_flight: AtomicU64,
}

/// Point-in-time copy of [`SchedulerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerMetricsSnapshot {
    /// Requests accepted by `queue_request`.
    pub requests_queued: u64,
    /// Requests pulled from the pending list into the scheduler.
    pub requests_prepared: u64,
    /// Requests handed to the processing stack.
    pub requests_dispatched: u64,
    /// External requests that retired as completed.
    pub requests_completed: u64,
    /// External requests that retired as failed.
    pub requests_failed: u64,
    /// External requests that retired as canceled.
    pub requests_canceled: u64,
    /// Reads that could not get an output buffer.
    pub allocation_failures: u64,
    /// Cancel commands dispatched.
    pub cancels_processed: u64,
    /// Reschedule commands dispatched.
    pub reschedules_processed: u64,
    /// Flush and flush-all commands dispatched.
    pub flushes_processed: u64,
    /// Number of schedule phases run.
    pub schedule_passes: u64,
    /// Total time spent sorting the prepared queue.
    pub schedule_time_ns: u64,
    /// Largest prepared queue seen by a schedule phase.
    pub max_prepared_depth: u64,
    /// Largest number of requests seen in flight in the stack.
    pub max_in_flight: u64,
}

impl SchedulerMetrics {
    /// Creates zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_queued(&self, count: u64) {
        self.requests_queued.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_prepared(&self, count: u64) {
        self.requests_prepared.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_dispatched(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_canceled(&self) {
        self.requests_canceled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_cancel(&self) {
        self.cancels_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reschedule(&self) {
        self.reschedules_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_flush(&self) {
        self.flushes_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_schedule_pass(&self, elapsed: Duration, prepared_depth: usize) {
        self.schedule_passes.fetch_add(1, Ordering::Relaxed);
        self.schedule_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.max_prepared_depth
            .fetch_max(prepared_depth as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_in_flight(&self, in_flight: usize) {
        self.max_in_flight
            .fetch_max(in_flight as u64, Ordering::Relaxed);
    }

    /// Returns a copy of all counters.
    pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
        SchedulerMetricsSnapshot {
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_prepared: self.requests_prepared.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_canceled: self.requests_canceled.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            cancels_processed: self.cancels_processed.load(Ordering::Relaxed),
            reschedules_processed: self.reschedules_processed.load(Ordering::Relaxed),
            flushes_processed: self.flushes_processed.load(Ordering::Relaxed),
            schedule_passes: self.schedule_passes.load(Ordering::Relaxed),
            schedule_time_ns: self.schedule_time_ns.load(Ordering::Relaxed),
            max_prepared_depth: self.max_prepared_depth.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
        }
    }

    /// Appends the scheduler statistics under `owner`.
    pub fn collect(&self, owner: &str, statistics: &mut Vec<Statistic>) {
        let snapshot = self.snapshot();
        statistics.push(Statistic::integer(owner, "Requests queued", snapshot.requests_queued as i64));
        statistics.push(Statistic::integer(owner, "Requests dispatched", snapshot.requests_dispatched as i64));
        statistics.push(Statistic::integer(owner, "Requests completed", snapshot.requests_completed as i64));
        statistics.push(Statistic::integer(owner, "Requests failed", snapshot.requests_failed as i64));
        statistics.push(Statistic::integer(owner, "Requests canceled", snapshot.requests_canceled as i64));
        statistics.push(Statistic::integer(owner, "Allocation failures", snapshot.allocation_failures as i64));
        statistics.push(Statistic::integer(owner, "Max prepared depth", snapshot.max_prepared_depth as i64));
        statistics.push(Statistic::integer(owner, "Max in flight", snapshot.max_in_flight as i64));

        let average = if snapshot.schedule_passes == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(snapshot.schedule_time_ns / snapshot.schedule_passes)
        };
        statistics.push(Statistic::new(
            owner,
            "Average schedule time",
            StatisticValue::Duration(average),
        ));

        let retired =
            snapshot.requests_completed + snapshot.requests_failed + snapshot.requests_canceled;
        statistics.push(Statistic::percentage(
            owner,
            "Failed requests",
            snapshot.requests_failed,
            retired,
        ));
    }
}
