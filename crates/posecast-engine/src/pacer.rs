//! Fixed-rate frame pacer.
//!
//! Ticks at the configured frequency and hands a snapshot of the frame
//! buffer to the distribution channel every `skip_frames`-th tick. At most
//! one dispatch is in flight: a newer dispatch cancels the previous one and
//! waits for it to finish (or aborts it after a grace period) before it
//! starts, so an older frame never reaches the wire after a newer one.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use posecast_encoder::TrackedBodyFrame;
use posecast_ipc::PipelineConfig;
use posecast_transport::{DistributionChannel, ErrorKind};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::buffer::SharedFrameBuffer;
use crate::metrics::MetricsCollector;

/// Pacer lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PacerState {
    #[default]
    Idle,
    /// Timer running, no dispatch in flight.
    Scheduled,
    /// Timer running and one dispatch in flight.
    Dispatching,
}

/// Shared view of the pacer state.
#[derive(Debug, Clone, Default)]
pub struct PacerStatus(Arc<Mutex<PacerState>>);

impl PacerStatus {
    pub fn get(&self) -> PacerState {
        *self.0.lock()
    }

    fn set(&self, state: PacerState) {
        *self.0.lock() = state;
    }
}

/// Decides which ticks dispatch: every `every`-th one, starting with tick `every`.
#[derive(Debug, Clone)]
pub struct Throttle {
    every: u64,
    ticks: u64,
}

impl Throttle {
    pub fn new(every: u32) -> Self {
        Self {
            every: u64::from(every.max(1)),
            ticks: 0,
        }
    }

    /// Count one tick and report whether it dispatches.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        self.ticks % self.every == 0
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

struct Dispatch {
    sequence: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives dispatches from the shared buffer into a channel.
pub struct FramePacer {
    buffer: Arc<SharedFrameBuffer>,
    channel: Arc<dyn DistributionChannel>,
    metrics: Arc<MetricsCollector>,
    period: Duration,
    grace: Duration,
    throttle: Throttle,
    status: PacerStatus,
    in_flight: Option<Dispatch>,
    next_sequence: u64,
}

impl FramePacer {
    pub fn new(
        buffer: Arc<SharedFrameBuffer>,
        channel: Arc<dyn DistributionChannel>,
        metrics: Arc<MetricsCollector>,
        config: &PipelineConfig,
    ) -> Self {
        let period = config.tick_period();
        Self {
            buffer,
            channel,
            metrics,
            period,
            grace: period,
            throttle: Throttle::new(config.skip_frames),
            status: PacerStatus::default(),
            in_flight: None,
            next_sequence: 0,
        }
    }

    /// How long a superseded dispatch may take to honor cancellation.
    ///
    /// A dispatch still running after the grace is aborted. The abort takes
    /// effect at the dispatch's next `.await`, so a datagram already handed to
    /// the socket is never split; a fragmented payload cut short is
    /// discarded whole by the receiving link.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn status(&self) -> PacerStatus {
        self.status.clone()
    }

    /// Run on `runtime` until the returned task is shut down.
    pub fn spawn(self, runtime: &Handle) -> PacerTask {
        let stop = CancellationToken::new();
        let status = self.status.clone();
        let handle = runtime.spawn(self.run(stop.clone()));
        PacerTask { stop, handle, status }
    }

    #[instrument(name = "pacer_run", skip_all)]
    pub async fn run(mut self, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.status.set(PacerState::Scheduled);
        info!(
            channel = self.channel.name(),
            period_ms = self.period.as_millis() as u64,
            "Pacer started"
        );

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => self.on_tick().await,
            }
        }

        self.supersede().await;
        self.status.set(PacerState::Idle);
        info!(ticks = self.throttle.ticks(), dispatches = self.next_sequence, "Pacer stopped");
    }

    async fn on_tick(&mut self) {
        self.metrics.record_tick();

        if !self.throttle.tick() {
            return;
        }

        let snapshot = self.buffer.snapshot();
        if snapshot.is_empty() {
            trace!("Nothing to dispatch");
            return;
        }

        self.supersede().await;
        self.start_dispatch(snapshot);
    }

    /// Cancel the in-flight dispatch and wait until it is gone.
    async fn supersede(&mut self) {
        let Some(mut previous) = self.in_flight.take() else {
            return;
        };
        if previous.handle.is_finished() {
            return;
        }

        previous.cancel.cancel();
        self.metrics.record_cancelled_dispatch();

        if tokio::time::timeout(self.grace, &mut previous.handle).await.is_err() {
            warn!(sequence = previous.sequence, "Dispatch ignored cancellation, aborting");
            // Lands at the next await point, between whole writes.
            previous.handle.abort();
            let _ = previous.handle.await;
        } else {
            debug!(sequence = previous.sequence, "Superseded dispatch finished");
        }
    }

    fn start_dispatch(&mut self, frame: TrackedBodyFrame) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let cancel = CancellationToken::new();
        let channel = Arc::clone(&self.channel);
        let metrics = Arc::clone(&self.metrics);
        let status = self.status.clone();

        self.metrics.record_dispatch();
        self.status.set(PacerState::Dispatching);

        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            dispatch(channel.as_ref(), &frame, &token, &metrics, sequence).await;
            status.set(PacerState::Scheduled);
        });

        self.in_flight = Some(Dispatch {
            sequence,
            cancel,
            handle,
        });
    }
}

async fn dispatch(
    channel: &dyn DistributionChannel,
    frame: &TrackedBodyFrame,
    cancel: &CancellationToken,
    metrics: &MetricsCollector,
    sequence: u64,
) {
    match channel.send(frame, cancel).await {
        Ok(report) if report.is_skipped() => {
            trace!(sequence, "No recipients");
            metrics.record_skipped_send();
        }
        Ok(report) => {
            trace!(
                sequence,
                bytes = report.bytes_sent,
                recipients = report.recipients,
                "Dispatch sent"
            );
            metrics.record_bytes_sent(report.bytes_sent);
        }
        Err(e) if e.kind() == ErrorKind::Cancelled => {
            debug!(sequence, "Dispatch cancelled");
        }
        Err(e) if e.is_steady_state() => {
            debug!(sequence, channel = channel.name(), "Dispatch skipped: {}", e);
            metrics.record_skipped_send();
        }
        Err(e) => {
            warn!(sequence, channel = channel.name(), "Dispatch failed: {}", e);
            metrics.record_failed_dispatch();
        }
    }
}

/// A running pacer.
pub struct PacerTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
    status: PacerStatus,
}

impl PacerTask {
    pub fn state(&self) -> PacerState {
        self.status.get()
    }

    /// Stop the timer and wait for the in-flight dispatch to wind down.
    pub async fn shutdown(mut self, timeout: Duration) {
        self.stop.cancel();
        if tokio::time::timeout(timeout, &mut self.handle).await.is_err() {
            warn!("Pacer did not stop in time, aborting");
            self.handle.abort();
        }
    }
}

impl Drop for PacerTask {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use posecast_capture::{CaptureTimestamp, RawBodySample, Transform, JOINT_COUNT};
    use posecast_encoder::PoseEncoder;
    use posecast_transport::{ChannelError, ChannelResult, SendReport};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Step {
        Start(u64),
        Wrote(u64),
        Cancelled(u64),
    }

    /// Channel whose sends take `delay` and honor cancellation unless told not to.
    struct ScriptedChannel {
        delay: Duration,
        honor_cancel: bool,
        fail: bool,
        calls: AtomicU64,
        log: Mutex<Vec<Step>>,
    }

    impl ScriptedChannel {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                honor_cancel: true,
                fail: false,
                calls: AtomicU64::new(0),
                log: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DistributionChannel for ScriptedChannel {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send(&self, _frame: &TrackedBodyFrame, cancel: &CancellationToken) -> ChannelResult<SendReport> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(Step::Start(call));

            if self.honor_cancel {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.log.lock().push(Step::Cancelled(call));
                        return Err(ChannelError::Cancelled);
                    }
                    _ = tokio::time::sleep(self.delay) => {}
                }
            } else {
                tokio::time::sleep(self.delay).await;
            }

            if self.fail {
                return Err(ChannelError::SendFailed("scripted failure".into()));
            }
            self.log.lock().push(Step::Wrote(call));
            Ok(SendReport {
                bytes_sent: 10,
                messages: 1,
                recipients: 1,
            })
        }
    }

    fn filled_buffer() -> Arc<SharedFrameBuffer> {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let body = Uuid::new_v4();
        let sample = RawBodySample::new(
            body,
            vec![Transform::IDENTITY; JOINT_COUNT],
            true,
            Transform::IDENTITY,
            CaptureTimestamp::from_secs(0.0),
        );
        buffer.publish(body, PoseEncoder::default().encode(&sample, &Transform::IDENTITY));
        buffer
    }

    fn config(skip_frames: u32) -> PipelineConfig {
        PipelineConfig {
            target_hz: 30,
            skip_frames,
            ..Default::default()
        }
    }

    /// Run a pacer for exactly `ticks` ticks on the paused clock.
    async fn run_for(pacer: FramePacer, ticks: u32) {
        let period = pacer.period;
        let stop = CancellationToken::new();
        let task = tokio::spawn(pacer.run(stop.clone()));
        tokio::time::sleep(period * ticks - period / 2).await;
        stop.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_throttle_first_dispatch_on_nth_tick() {
        let mut throttle = Throttle::new(3);
        let pattern: Vec<bool> = (0..6).map(|_| throttle.tick()).collect();
        assert_eq!(pattern, vec![false, false, true, false, false, true]);
        assert!(Throttle::new(0).tick());
    }

    proptest! {
        #[test]
        fn prop_throttle_window_counts(every in 1u32..12, start in 0usize..200, len in 0usize..400) {
            let mut throttle = Throttle::new(every);
            let fired: Vec<bool> = (0..start + len).map(|_| throttle.tick()).collect();
            let count = fired[start..].iter().filter(|f| **f).count();

            let n = every as usize;
            let floor = len / n;
            let ceil = (len + n - 1) / n;
            prop_assert!(count == floor || count == ceil, "{} not in [{}, {}]", count, floor, ceil);
            if start == 0 {
                prop_assert_eq!(count, floor);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_count_follows_skip_frames() {
        let channel = Arc::new(ScriptedChannel::new(Duration::from_millis(1)));
        let metrics = Arc::new(MetricsCollector::new());
        let pacer = FramePacer::new(filled_buffer(), channel.clone(), metrics.clone(), &config(3));

        run_for(pacer, 30).await;

        assert_eq!(metrics.snapshot().ticks, 30);
        assert_eq!(channel.calls(), 10);
        assert_eq!(metrics.snapshot().dispatches, 10);
        assert_eq!(metrics.snapshot().cancelled_dispatches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_is_not_dispatched() {
        let channel = Arc::new(ScriptedChannel::new(Duration::from_millis(1)));
        let metrics = Arc::new(MetricsCollector::new());
        let pacer = FramePacer::new(
            Arc::new(SharedFrameBuffer::new()),
            channel.clone(),
            metrics.clone(),
            &config(1),
        );

        run_for(pacer, 10).await;

        assert_eq!(metrics.snapshot().ticks, 10);
        assert_eq!(channel.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_dispatch_never_writes_after_successor_starts() {
        // Every send outlasts the tick period, so each tick supersedes the last.
        let channel = Arc::new(ScriptedChannel::new(Duration::from_secs(1)));
        let metrics = Arc::new(MetricsCollector::new());
        let pacer = FramePacer::new(filled_buffer(), channel.clone(), metrics.clone(), &config(1));

        run_for(pacer, 8).await;

        let log = channel.log.lock().clone();
        assert_eq!(channel.calls(), 8);
        assert!(!log.iter().any(|step| matches!(step, Step::Wrote(_))));
        for call in 1..8u64 {
            let started = log.iter().position(|s| *s == Step::Start(call)).unwrap();
            let cancelled = log.iter().position(|s| *s == Step::Cancelled(call - 1)).unwrap();
            assert!(cancelled < started, "call {} started before its predecessor ended", call);
        }
        // The last one is cancelled by the pacer stopping.
        assert_eq!(metrics.snapshot().cancelled_dispatches, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_dispatch_is_aborted_after_grace() {
        let mut channel = ScriptedChannel::new(Duration::from_secs(10));
        channel.honor_cancel = false;
        let channel = Arc::new(channel);
        let metrics = Arc::new(MetricsCollector::new());
        let pacer = FramePacer::new(filled_buffer(), channel.clone(), metrics.clone(), &config(1))
            .with_grace(Duration::from_millis(5));

        run_for(pacer, 5).await;

        assert!(channel.calls() >= 2, "pacer stalled behind a stubborn dispatch");
        assert!(!channel.log.lock().iter().any(|s| matches!(s, Step::Wrote(_))));
    }

    /// Channel that writes a payload as a run of chunks and ignores cancellation.
    struct ChunkedChannel {
        chunks: usize,
        gap: Duration,
        calls: AtomicU64,
        log: Mutex<Vec<(u64, Option<usize>)>>,
    }

    #[async_trait]
    impl DistributionChannel for ChunkedChannel {
        fn name(&self) -> &'static str {
            "chunked"
        }

        async fn send(&self, _frame: &TrackedBodyFrame, _cancel: &CancellationToken) -> ChannelResult<SendReport> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push((call, None));
            for index in 0..self.chunks {
                self.log.lock().push((call, Some(index)));
                tokio::time::sleep(self.gap).await;
            }
            Ok(SendReport {
                bytes_sent: self.chunks as u64,
                messages: self.chunks as u64,
                recipients: 1,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_lands_between_whole_writes() {
        let channel = Arc::new(ChunkedChannel {
            chunks: 4,
            gap: Duration::from_millis(20),
            calls: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(MetricsCollector::new());
        let pacer = FramePacer::new(filled_buffer(), channel.clone(), metrics, &config(1))
            .with_grace(Duration::from_millis(5));

        run_for(pacer, 6).await;

        let log = channel.log.lock().clone();
        assert!(channel.calls.load(Ordering::SeqCst) >= 2);

        // Each call wrote a contiguous prefix of its chunks.
        for call in 0..channel.calls.load(Ordering::SeqCst) {
            let written: Vec<usize> = log
                .iter()
                .filter(|(c, chunk)| *c == call && chunk.is_some())
                .filter_map(|(_, chunk)| *chunk)
                .collect();
            assert_eq!(written, (0..written.len()).collect::<Vec<_>>());
            assert!(written.len() < 4, "call {call} was never superseded");
        }

        // Nothing from a superseded call lands once its successor started.
        for (position, (call, chunk)) in log.iter().enumerate() {
            if chunk.is_none() && *call > 0 {
                assert!(log[position..].iter().all(|(c, _)| *c >= *call));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_timer() {
        let mut channel = ScriptedChannel::new(Duration::from_millis(1));
        channel.fail = true;
        let channel = Arc::new(channel);
        let metrics = Arc::new(MetricsCollector::new());
        let pacer = FramePacer::new(filled_buffer(), channel.clone(), metrics.clone(), &config(2));

        run_for(pacer, 20).await;

        assert_eq!(channel.calls(), 10);
        assert_eq!(metrics.snapshot().failed_dispatches, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_returns_to_idle() {
        let channel = Arc::new(ScriptedChannel::new(Duration::from_millis(1)));
        let pacer = FramePacer::new(
            filled_buffer(),
            channel,
            Arc::new(MetricsCollector::new()),
            &config(1),
        );
        let status = pacer.status();
        assert_eq!(status.get(), PacerState::Idle);

        let task = pacer.spawn(&Handle::current());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_ne!(task.state(), PacerState::Idle);

        task.shutdown(Duration::from_secs(1)).await;
        assert_eq!(status.get(), PacerState::Idle);
    }
}
