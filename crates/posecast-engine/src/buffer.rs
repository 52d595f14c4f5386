//! Latest-frame buffer shared by the capture worker and the pacer.

use parking_lot::Mutex;
use posecast_capture::BodyId;
use posecast_encoder::{JointRecord, TrackedBodyFrame};

/// Most recent encoded records per body.
///
/// Writers replace a body's records whole and readers only ever get an
/// owned copy, so a reader never observes a half-written body.
#[derive(Default)]
pub struct SharedFrameBuffer {
    frame: Mutex<TrackedBodyFrame>,
}

impl SharedFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the records of one body.
    pub fn publish(&self, body: BodyId, records: Vec<JointRecord>) {
        self.frame.lock().insert(body, records);
    }

    /// Drop a body from the buffer. Returns true if it was present.
    pub fn remove(&self, body: &BodyId) -> bool {
        self.frame.lock().remove(body).is_some()
    }

    /// Copy of every body's latest records.
    pub fn snapshot(&self) -> TrackedBodyFrame {
        self.frame.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use posecast_capture::{CaptureTimestamp, RawBodySample, Transform, JOINT_COUNT};
    use posecast_encoder::PoseEncoder;
    use std::sync::Arc;
    use std::thread;
    use uuid::Uuid;

    fn records(body: BodyId, t: f64) -> Vec<JointRecord> {
        let sample = RawBodySample::new(
            body,
            vec![Transform::IDENTITY; JOINT_COUNT],
            true,
            Transform::IDENTITY,
            CaptureTimestamp::from_secs(t),
        );
        PoseEncoder::default().encode(&sample, &Transform::IDENTITY)
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let buffer = SharedFrameBuffer::new();
        let body = Uuid::new_v4();
        buffer.publish(body, records(body, 0.0));

        let before = buffer.snapshot();
        assert!(buffer.remove(&body));

        assert_eq!(before.len(), 1);
        assert!(buffer.snapshot().is_empty());
    }

    #[test]
    fn test_remove_missing_body() {
        let buffer = SharedFrameBuffer::new();
        assert!(!buffer.remove(&Uuid::new_v4()));
    }

    #[test]
    fn test_concurrent_readers_see_whole_bodies() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let body = Uuid::new_v4();

        let writer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 0..200 {
                    buffer.publish(body, records(body, f64::from(i)));
                }
            })
        };

        for _ in 0..200 {
            let snapshot = buffer.snapshot();
            if let Some(records) = snapshot.get(&body) {
                assert_eq!(records.len(), JOINT_COUNT);
                let t = records[0].metadata.timestamp;
                assert!(records.iter().all(|r| r.metadata.timestamp == t));
            }
        }
        writer.join().unwrap();
    }
}
