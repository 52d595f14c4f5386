//! Raw body sample types.

use std::time::Instant;

use uuid::Uuid;

use crate::transform::Transform;

/// Stable identifier of one tracked body within a session.
pub type BodyId = Uuid;

/// Timestamp of a captured sample, in seconds on the capture clock.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct CaptureTimestamp {
    pub seconds: f64,
}

impl CaptureTimestamp {
    /// Timestamp for "now", relative to the source's start time.
    pub fn now(start_time: Instant) -> Self {
        Self {
            seconds: start_time.elapsed().as_secs_f64(),
        }
    }

    /// Timestamp from an explicit clock value.
    pub fn from_secs(seconds: f64) -> Self {
        Self { seconds }
    }

    /// Get the timestamp in milliseconds.
    pub fn millis(&self) -> u64 {
        (self.seconds * 1_000.0) as u64
    }
}

/// One tracked body as reported by the tracking subsystem for one update.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBodySample {
    /// Body identity.
    pub body_id: BodyId,

    /// Joint-local transforms, indexed by skeleton definition order.
    pub joints: Vec<Transform>,

    /// Whether the tracker currently has a lock on this body.
    pub is_tracked: bool,

    /// World transform of the body anchor.
    pub anchor: Transform,

    /// Capture timestamp.
    pub timestamp: CaptureTimestamp,
}

impl RawBodySample {
    /// Create a new sample.
    pub fn new(
        body_id: BodyId,
        joints: Vec<Transform>,
        is_tracked: bool,
        anchor: Transform,
        timestamp: CaptureTimestamp,
    ) -> Self {
        Self {
            body_id,
            joints,
            is_tracked,
            anchor,
            timestamp,
        }
    }

    /// Whether the sample has one transform per skeleton joint.
    pub fn is_complete(&self) -> bool {
        self.joints.len() == crate::JOINT_COUNT
    }
}

/// All bodies reported by one tracker callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBatch {
    /// Samples, one per body updated in this callback.
    pub samples: Vec<RawBodySample>,

    /// Monotonically increasing sequence number.
    pub sequence: u64,
}

impl SampleBatch {
    /// Create a new batch.
    pub fn new(samples: Vec<RawBodySample>, sequence: u64) -> Self {
        Self { samples, sequence }
    }
}
