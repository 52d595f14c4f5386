//! Metrics collection and reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use posecast_ipc::{PipelineMetrics, WarningType};

/// Failed dispatches per report interval before a warning is raised.
const SEND_FAILURE_WARNING: u64 = 3;

/// Encoder drops per report interval before a warning is raised.
const ENCODE_DROP_WARNING: u64 = 10;

/// Collects and reports pipeline metrics.
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    ticks: AtomicU64,
    dispatches: AtomicU64,
    cancelled_dispatches: AtomicU64,
    failed_dispatches: AtomicU64,
    skipped_sends: AtomicU64,
    encode_drops: AtomicU64,
    bytes_sent: AtomicU64,
    tracked_bodies: AtomicU64,
    last_report_time: RwLock<Instant>,
    last_dispatches: AtomicU64,
    last_cancelled: AtomicU64,
    last_failed: AtomicU64,
    last_encode_drops: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            ticks: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            cancelled_dispatches: AtomicU64::new(0),
            failed_dispatches: AtomicU64::new(0),
            skipped_sends: AtomicU64::new(0),
            encode_drops: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            tracked_bodies: AtomicU64::new(0),
            last_report_time: RwLock::new(Instant::now()),
            last_dispatches: AtomicU64::new(0),
            last_cancelled: AtomicU64::new(0),
            last_failed: AtomicU64::new(0),
            last_encode_drops: AtomicU64::new(0),
        }
    }

    /// Start metrics collection.
    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
        *self.last_report_time.write() = Instant::now();
    }

    /// Stop metrics collection.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dispatch handed to the channel.
    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled_dispatch(&self) {
        self.cancelled_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_dispatch(&self) {
        self.failed_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send that had nobody to deliver to.
    pub fn record_skipped_send(&self) {
        self.skipped_sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a body the encoder refused.
    pub fn record_encode_drop(&self) {
        self.encode_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes sent.
    pub fn record_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_tracked_bodies(&self, count: usize) {
        self.tracked_bodies.store(count as u64, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> PipelineMetrics {
        let now = Instant::now();

        let elapsed = now.duration_since(*self.last_report_time.read());
        let dispatches = self.dispatches.load(Ordering::Relaxed);
        let last_dispatches = self.last_dispatches.load(Ordering::Relaxed);
        let dispatch_rate_hz = if elapsed.as_secs_f32() > 0.0 {
            dispatches.saturating_sub(last_dispatches) as f32 / elapsed.as_secs_f32()
        } else {
            0.0
        };

        let uptime_seconds = self
            .start_time
            .read()
            .map(|s| now.duration_since(s).as_secs())
            .unwrap_or(0);

        PipelineMetrics {
            ticks: self.ticks.load(Ordering::Relaxed),
            dispatches,
            dispatch_rate_hz,
            cancelled_dispatches: self.cancelled_dispatches.load(Ordering::Relaxed),
            failed_dispatches: self.failed_dispatches.load(Ordering::Relaxed),
            skipped_sends: self.skipped_sends.load(Ordering::Relaxed),
            encode_drops: self.encode_drops.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            tracked_bodies: self.tracked_bodies.load(Ordering::Relaxed),
            uptime_seconds,
        }
    }

    /// Check for warnings based on activity since the last report.
    pub fn check_warnings(&self) -> Vec<WarningType> {
        let mut warnings = Vec::new();

        let delta = |current: &AtomicU64, last: &AtomicU64| {
            current
                .load(Ordering::Relaxed)
                .saturating_sub(last.load(Ordering::Relaxed))
        };

        let dispatched = delta(&self.dispatches, &self.last_dispatches);
        let cancelled = delta(&self.cancelled_dispatches, &self.last_cancelled);
        if cancelled > 0 && cancelled * 2 >= dispatched {
            warnings.push(WarningType::DispatchBacklog { cancelled });
        }

        let failed = delta(&self.failed_dispatches, &self.last_failed);
        if failed >= SEND_FAILURE_WARNING {
            warnings.push(WarningType::SendFailures { count: failed });
        }

        let dropped = delta(&self.encode_drops, &self.last_encode_drops);
        if dropped >= ENCODE_DROP_WARNING {
            warnings.push(WarningType::EncodeDrops { count: dropped });
        }

        warnings
    }

    /// Update the baselines used for rates and warnings.
    pub fn mark_reported(&self) {
        *self.last_report_time.write() = Instant::now();
        let pairs = [
            (&self.dispatches, &self.last_dispatches),
            (&self.cancelled_dispatches, &self.last_cancelled),
            (&self.failed_dispatches, &self.last_failed),
            (&self.encode_drops, &self.last_encode_drops),
        ];
        for (current, last) in pairs {
            last.store(current.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
