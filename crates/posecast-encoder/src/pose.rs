//! Raw sample to joint record conversion.

use posecast_capture::{RawBodySample, Transform, JOINT_COUNT, JOINT_NAMES};
use posecast_ipc::{PipelineConfig, RecordIdStrategy, RoundingPrecision};
use tracing::debug;
use uuid::Uuid;

use crate::record::{AnchorPose, JointMetadata, JointRecord, Orientation, Vector3};

/// Converts raw tracker samples into canonical joint records.
///
/// Encoding is pure: with [`RecordIdStrategy::Derived`] the same sample and
/// anchor always produce identical records.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoseEncoder {
    precision: RoundingPrecision,
    ids: RecordIdStrategy,
}

impl PoseEncoder {
    pub fn new(precision: RoundingPrecision, ids: RecordIdStrategy) -> Self {
        Self { precision, ids }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.precision, config.record_ids)
    }

    /// Encode one body into one record per skeleton joint, in skeleton order.
    ///
    /// Returns an empty vector when the sample is incomplete or contains a
    /// non-finite value; the caller skips the body for this tick.
    pub fn encode(&self, sample: &RawBodySample, anchor: &Transform) -> Vec<JointRecord> {
        if sample.joints.len() != JOINT_COUNT {
            debug!(
                body = %sample.body_id,
                joints = sample.joints.len(),
                "Skipping body with incomplete skeleton"
            );
            return Vec::new();
        }
        if !anchor.is_finite() || !sample.joints.iter().all(Transform::is_finite) {
            debug!(body = %sample.body_id, "Skipping body with non-finite pose");
            return Vec::new();
        }

        let anchor_pose = self.anchor_pose(anchor);
        let timestamp = sample.timestamp.seconds;

        sample
            .joints
            .iter()
            .zip(JOINT_NAMES.iter())
            .enumerate()
            .map(|(index, (joint, name))| JointRecord {
                id: self.record_id(sample, index, timestamp),
                metadata: JointMetadata {
                    index: index as u32,
                    timestamp,
                    name: (*name).to_string(),
                    body_id: sample.body_id,
                    is_tracked: sample.is_tracked,
                },
                translation: Vector3 {
                    x: self.round(joint.translation.x),
                    y: self.round(joint.translation.y),
                    z: self.round(joint.translation.z),
                },
                orientation: Orientation {
                    r: self.round(joint.rotation.real),
                    ix: self.round(joint.rotation.imag.x),
                    iy: self.round(joint.rotation.imag.y),
                    iz: self.round(joint.rotation.imag.z),
                },
                scale: Vector3 {
                    x: self.round(joint.scale.x),
                    y: self.round(joint.scale.y),
                    z: self.round(joint.scale.z),
                },
                anchor: anchor_pose,
            })
            .collect()
    }

    fn anchor_pose(&self, anchor: &Transform) -> AnchorPose {
        AnchorPose {
            x: self.round(anchor.translation.x),
            y: self.round(anchor.translation.y),
            z: self.round(anchor.translation.z),
            r: self.round(anchor.rotation.real),
            ix: self.round(anchor.rotation.imag.x),
            iy: self.round(anchor.rotation.imag.y),
            iz: self.round(anchor.rotation.imag.z),
        }
    }

    fn round(&self, value: f32) -> f64 {
        self.precision.apply(value)
    }

    fn record_id(&self, sample: &RawBodySample, index: usize, timestamp: f64) -> Uuid {
        match self.ids {
            RecordIdStrategy::Random => Uuid::new_v4(),
            RecordIdStrategy::Derived => {
                let mut name = [0u8; 12];
                name[..4].copy_from_slice(&(index as u32).to_le_bytes());
                name[4..].copy_from_slice(&timestamp.to_bits().to_le_bytes());
                Uuid::new_v5(&sample.body_id, &name)
            }
        }
    }
}
