//! Synthetic frame source that animates a set of walking bodies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::CaptureError;
use crate::frame::{BodyId, CaptureTimestamp, RawBodySample, SampleBatch};
use crate::transform::{Quat, Transform, Vec3};
use crate::{CaptureResult, FrameSource, JOINT_COUNT, SAMPLE_CHANNEL_CAPACITY};

/// Generates plausible, moving skeletons at a fixed capture rate.
pub struct SyntheticSource {
    body_ids: Vec<BodyId>,
    capture_hz: u32,
    capture_thread: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
}

impl SyntheticSource {
    /// Create a source animating `bodies` bodies at `capture_hz`.
    pub fn new(bodies: usize, capture_hz: u32) -> Self {
        Self {
            body_ids: (0..bodies).map(|_| Uuid::new_v4()).collect(),
            capture_hz: capture_hz.max(1),
            capture_thread: None,
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Identities of the generated bodies.
    pub fn body_ids(&self) -> &[BodyId] {
        &self.body_ids
    }

    /// Pose of every body at time `t` seconds.
    pub fn samples_at(body_ids: &[BodyId], t: f64) -> Vec<RawBodySample> {
        body_ids
            .iter()
            .enumerate()
            .map(|(slot, body_id)| {
                let phase = t as f32 + slot as f32 * 1.7;
                let heading = Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), phase * 0.25);
                let anchor = Transform::new(
                    Vec3::new(phase.cos() * 1.5, 0.0, phase.sin() * 1.5 - 2.0),
                    heading,
                    Vec3::ONE,
                );

                let joints = (0..JOINT_COUNT)
                    .map(|index| {
                        let swing = (phase * 2.0 + index as f32 * 0.3).sin() * 0.2;
                        Transform::new(
                            Vec3::new(0.0, 0.05 + index as f32 * 0.001, 0.0),
                            Quat::from_axis_angle(Vec3::new(1.0, 0.0, 0.0), swing),
                            Vec3::ONE,
                        )
                    })
                    .collect();

                RawBodySample::new(
                    *body_id,
                    joints,
                    true,
                    anchor,
                    CaptureTimestamp::from_secs(t),
                )
            })
            .collect()
    }
}

impl FrameSource for SyntheticSource {
    fn is_supported(&self) -> bool {
        true
    }

    #[instrument(name = "synthetic_start", skip(self), fields(bodies = self.body_ids.len()))]
    fn start(&mut self) -> CaptureResult<Receiver<SampleBatch>> {
        if self.capture_thread.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }

        let (sender, receiver) = crossbeam_channel::bounded(SAMPLE_CHANNEL_CAPACITY);
        let should_stop = Arc::clone(&self.should_stop);
        should_stop.store(false, Ordering::SeqCst);

        let body_ids = self.body_ids.clone();
        let interval = Duration::from_nanos(1_000_000_000 / u64::from(self.capture_hz));

        let handle = thread::Builder::new()
            .name("synthetic-capture".into())
            .spawn(move || capture_thread(body_ids, interval, sender, should_stop))?;

        self.capture_thread = Some(handle);
        info!(capture_hz = self.capture_hz, "Synthetic source started");
        Ok(receiver)
    }

    fn stop(&mut self) -> CaptureResult<()> {
        let handle = self.capture_thread.take().ok_or(CaptureError::NotStarted)?;
        self.should_stop.store(true, Ordering::SeqCst);
        let _ = handle.join();
        info!("Synthetic source stopped");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.capture_thread.is_some()
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
    }
}

fn capture_thread(
    body_ids: Vec<BodyId>,
    interval: Duration,
    sender: Sender<SampleBatch>,
    should_stop: Arc<AtomicBool>,
) {
    let start_time = Instant::now();
    let mut sequence = 0u64;
    let mut dropped = 0u64;

    while !should_stop.load(Ordering::SeqCst) {
        let tick_start = Instant::now();
        let t = CaptureTimestamp::now(start_time).seconds;

        match sender.try_send(SampleBatch::new(
            SyntheticSource::samples_at(&body_ids, t),
            sequence,
        )) {
            Ok(()) => sequence += 1,
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped % 100 == 1 {
                    warn!(dropped, "Consumer behind, dropping synthetic samples");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Sample channel disconnected");
                break;
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }

    debug!(sequence, dropped, "Synthetic capture thread exiting");
}
