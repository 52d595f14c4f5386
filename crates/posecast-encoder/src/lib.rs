//! Pose encoding and the telemetry wire codec.
//!
//! This crate turns raw tracker samples into the canonical joint record
//! schema and serializes records and frames through one validated codec
//! with optional zstd compression.

mod codec;
mod error;
mod pose;
mod record;

pub use codec::WireCodec;
pub use error::EncoderError;
pub use pose::PoseEncoder;
pub use record::{AnchorPose, JointMetadata, JointRecord, JointSet, Orientation, TrackedBodyFrame, Vector3};

/// zstd level used for compressed payloads; favors speed over ratio.
pub const COMPRESSION_LEVEL: i32 = 1;

/// Largest payload the codec will inflate.
pub const MAX_DECODED_PAYLOAD: usize = 4 * 1024 * 1024;

/// Result type for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;
