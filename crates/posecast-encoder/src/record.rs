//! The joint record wire schema.

use std::collections::BTreeMap;

use posecast_capture::{BodyId, JOINT_COUNT, JOINT_NAMES};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EncoderError;
use crate::EncoderResult;

/// A position or scale vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A rotation quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub r: f64,
    pub ix: f64,
    pub iy: f64,
    pub iz: f64,
}

impl Default for Orientation {
    fn default() -> Self {
        Self {
            r: 1.0,
            ix: 0.0,
            iy: 0.0,
            iz: 0.0,
        }
    }
}

/// World pose of the owning body anchor at capture time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AnchorPose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub r: f64,
    pub ix: f64,
    pub iy: f64,
    pub iz: f64,
}

/// Per-record bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointMetadata {
    /// Position of the joint in the skeleton definition.
    #[serde(rename = "i")]
    pub index: u32,

    /// Capture timestamp in seconds.
    #[serde(rename = "t")]
    pub timestamp: f64,

    /// Joint name.
    pub name: String,

    /// Owning body.
    #[serde(rename = "ident")]
    pub body_id: BodyId,

    /// Tracker lock, carried on the wire as `1.0` / `0.0`.
    #[serde(rename = "a", with = "tracked_flag")]
    pub is_tracked: bool,
}

/// One joint's pose at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointRecord {
    pub id: Uuid,

    #[serde(rename = "d")]
    pub metadata: JointMetadata,

    #[serde(rename = "t")]
    pub translation: Vector3,

    #[serde(rename = "o")]
    pub orientation: Orientation,

    #[serde(rename = "s")]
    pub scale: Vector3,

    #[serde(rename = "a")]
    pub anchor: AnchorPose,
}

impl JointRecord {
    /// Check every numeric field is finite and the index matches the skeleton.
    pub fn validate(&self) -> EncoderResult<()> {
        let index = self.metadata.index as usize;
        let expected = JOINT_NAMES
            .get(index)
            .copied()
            .unwrap_or("<out of range>");
        if index >= JOINT_COUNT || self.metadata.name != expected {
            return Err(EncoderError::SkeletonMismatch {
                index: self.metadata.index,
                name: self.metadata.name.clone(),
                expected,
            });
        }

        let t = &self.translation;
        let o = &self.orientation;
        let s = &self.scale;
        let a = &self.anchor;
        let groups: [(&'static str, &[f64]); 5] = [
            ("timestamp", &[self.metadata.timestamp]),
            ("translation", &[t.x, t.y, t.z]),
            ("orientation", &[o.r, o.ix, o.iy, o.iz]),
            ("scale", &[s.x, s.y, s.z]),
            ("anchor", &[a.x, a.y, a.z, a.r, a.ix, a.iy, a.iz]),
        ];

        for (field, values) in groups {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(EncoderError::NonFinite {
                    joint: self.metadata.name.clone(),
                    field,
                });
            }
        }
        Ok(())
    }
}

/// Every body's records for one dispatch, keyed by body identity.
///
/// Backed by a `BTreeMap` so serialization order is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackedBodyFrame {
    bodies: BTreeMap<BodyId, Vec<JointRecord>>,
}

impl TrackedBodyFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the records of `body`, returning the previous ones.
    pub fn insert(&mut self, body: BodyId, records: Vec<JointRecord>) -> Option<Vec<JointRecord>> {
        self.bodies.insert(body, records)
    }

    pub fn remove(&mut self, body: &BodyId) -> Option<Vec<JointRecord>> {
        self.bodies.remove(body)
    }

    pub fn get(&self, body: &BodyId) -> Option<&[JointRecord]> {
        self.bodies.get(body).map(Vec::as_slice)
    }

    /// Bodies and their records in identity order.
    pub fn bodies(&self) -> impl Iterator<Item = (&BodyId, &[JointRecord])> {
        self.bodies.iter().map(|(id, records)| (id, records.as_slice()))
    }

    /// Every record of every body.
    pub fn records(&self) -> impl Iterator<Item = &JointRecord> {
        self.bodies.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Total number of joint records.
    pub fn joint_count(&self) -> usize {
        self.bodies.values().map(Vec::len).sum()
    }

    pub fn validate(&self) -> EncoderResult<()> {
        self.records().try_for_each(JointRecord::validate)
    }
}

/// One body's records keyed by joint name, the journal attachment payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JointSet {
    joints: BTreeMap<String, JointRecord>,
}

impl JointSet {
    pub fn from_records(records: &[JointRecord]) -> Self {
        Self {
            joints: records
                .iter()
                .map(|record| (record.metadata.name.clone(), record.clone()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&JointRecord> {
        self.joints.get(name)
    }

    /// Owning body, taken from any record.
    pub fn body_id(&self) -> Option<BodyId> {
        self.joints.values().next().map(|record| record.metadata.body_id)
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn validate(&self) -> EncoderResult<()> {
        self.joints.values().try_for_each(JointRecord::validate)
    }
}

mod tracked_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tracked: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(if *tracked { 1.0 } else { 0.0 })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let flag = f64::deserialize(deserializer)?;
        Ok(flag >= 0.5)
    }
}
