//! Capture worker: turns raw samples into encoded records in the buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use posecast_capture::{BodyId, SampleBatch};
use posecast_encoder::PoseEncoder;
use posecast_ipc::{BodyCount, PipelineConfig};
use tracing::{debug, info, instrument, trace, warn};

use crate::anchors::{AnchorLifecycleManager, TemplateSlot};
use crate::buffer::SharedFrameBuffer;
use crate::error::EngineError;
use crate::metrics::MetricsCollector;

/// Per-batch processing, owned by the worker thread.
pub struct CapturePipeline {
    encoder: PoseEncoder,
    anchors: AnchorLifecycleManager,
    buffer: Arc<SharedFrameBuffer>,
    metrics: Arc<MetricsCollector>,
    bodies: BodyCount,
    primary: Option<BodyId>,
}

impl CapturePipeline {
    pub fn new(
        config: &PipelineConfig,
        template: TemplateSlot,
        buffer: Arc<SharedFrameBuffer>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            encoder: PoseEncoder::from_config(config),
            anchors: AnchorLifecycleManager::from_config(template, config),
            buffer,
            metrics,
            bodies: config.bodies,
            primary: None,
        }
    }

    /// Apply one tracker update.
    pub fn process(&mut self, batch: &SampleBatch) {
        trace!(sequence = batch.sequence, samples = batch.samples.len(), "Processing batch");

        for sample in &batch.samples {
            if self.bodies == BodyCount::Single {
                match self.primary {
                    None => self.primary = Some(sample.body_id),
                    Some(primary) if primary != sample.body_id => continue,
                    Some(_) => {}
                }
            }

            let entry = self.anchors.upsert(sample.body_id, &sample.anchor, sample.is_tracked);
            let records = self.encoder.encode(sample, &entry.transform);
            if records.is_empty() {
                self.metrics.record_encode_drop();
                continue;
            }
            self.buffer.publish(sample.body_id, records);
        }

        for body in self.anchors.sweep() {
            self.buffer.remove(&body);
            if self.primary == Some(body) {
                self.primary = None;
            }
        }

        self.metrics.set_tracked_bodies(self.anchors.len());
    }
}

/// Thread draining the frame source into a [`CapturePipeline`].
pub struct CaptureWorker {
    thread: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
    source_lost: Arc<AtomicBool>,
}

impl CaptureWorker {
    pub fn spawn(samples: Receiver<SampleBatch>, pipeline: CapturePipeline) -> Result<Self, EngineError> {
        let should_stop = Arc::new(AtomicBool::new(false));
        let source_lost = Arc::new(AtomicBool::new(false));

        let thread = {
            let should_stop = Arc::clone(&should_stop);
            let source_lost = Arc::clone(&source_lost);
            thread::Builder::new()
                .name("posecast-capture".into())
                .spawn(move || capture_loop(samples, pipeline, should_stop, source_lost))?
        };

        Ok(Self {
            thread: Some(thread),
            should_stop,
            source_lost,
        })
    }

    /// True once the sample channel disconnected without a stop request.
    pub fn source_lost(&self) -> bool {
        self.source_lost.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[instrument(name = "capture_loop", skip_all)]
fn capture_loop(
    samples: Receiver<SampleBatch>,
    mut pipeline: CapturePipeline,
    should_stop: Arc<AtomicBool>,
    source_lost: Arc<AtomicBool>,
) {
    info!("Capture worker started");
    let mut batches = 0u64;

    while !should_stop.load(Ordering::SeqCst) {
        match samples.recv_timeout(Duration::from_millis(100)) {
            Ok(batch) => {
                pipeline.process(&batch);
                batches += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Sample channel disconnected");
                source_lost.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    debug!(batches, "Capture worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use posecast_capture::{CaptureTimestamp, RawBodySample, Transform, JOINT_COUNT};
    use uuid::Uuid;

    fn sample(body: BodyId, tracked: bool) -> RawBodySample {
        RawBodySample::new(
            body,
            vec![Transform::IDENTITY; JOINT_COUNT],
            tracked,
            Transform::IDENTITY,
            CaptureTimestamp::from_secs(0.5),
        )
    }

    fn pipeline(config: &PipelineConfig) -> (CapturePipeline, Arc<SharedFrameBuffer>, Arc<MetricsCollector>) {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let metrics = Arc::new(MetricsCollector::new());
        let pipeline = CapturePipeline::new(config, TemplateSlot::new(), Arc::clone(&buffer), Arc::clone(&metrics));
        (pipeline, buffer, metrics)
    }

    #[test]
    fn test_single_body_mode_keeps_first_body() {
        let config = PipelineConfig {
            bodies: BodyCount::Single,
            retire_after_untracked: 2,
            ..Default::default()
        };
        let (mut pipeline, buffer, _) = pipeline(&config);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        pipeline.process(&SampleBatch::new(vec![sample(first, true), sample(second, true)], 0));
        let frame = buffer.snapshot();
        assert_eq!(frame.len(), 1);
        assert!(frame.get(&first).is_some());

        // Once the first body is retired the next one takes over.
        pipeline.process(&SampleBatch::new(vec![sample(first, false)], 1));
        pipeline.process(&SampleBatch::new(vec![sample(first, false)], 2));
        assert_eq!(buffer.snapshot().len(), 0);

        pipeline.process(&SampleBatch::new(vec![sample(second, true)], 3));
        assert!(buffer.snapshot().get(&second).is_some());
    }

    #[test]
    fn test_incomplete_sample_is_dropped() {
        let (mut pipeline, buffer, metrics) = pipeline(&PipelineConfig::default());
        let mut bad = sample(Uuid::new_v4(), true);
        bad.joints.pop();

        pipeline.process(&SampleBatch::new(vec![bad], 0));

        assert_eq!(buffer.snapshot().len(), 0);
        assert_eq!(metrics.snapshot().encode_drops, 1);
        assert_eq!(metrics.snapshot().tracked_bodies, 1);
    }

    #[test]
    fn test_worker_reports_lost_source() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let (pipeline, buffer, _) = pipeline(&PipelineConfig::default());
        let mut worker = CaptureWorker::spawn(rx, pipeline).unwrap();

        tx.send(SampleBatch::new(vec![sample(Uuid::new_v4(), true)], 0)).unwrap();
        drop(tx);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !worker.source_lost() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.source_lost());
        assert_eq!(buffer.snapshot().len(), 1);
        worker.stop();
    }
}
