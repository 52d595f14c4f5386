//! Body-tracking frame sources for posecast.
//!
//! The tracking subsystem itself lives outside this workspace. This crate
//! defines what it hands us (per-body joint transforms plus an anchor), the
//! fixed skeleton those transforms are indexed by, and two sources: one fed
//! through a channel by an embedding application and one that synthesizes
//! moving bodies for demos and tests.

mod error;
mod frame;
pub mod skeleton;
mod source;
mod transform;

pub use error::CaptureError;
pub use frame::{BodyId, CaptureTimestamp, RawBodySample, SampleBatch};
pub use skeleton::{joint_index, JOINT_COUNT, JOINT_NAMES};
pub use source::channel::{ChannelSource, SampleFeed};
pub use source::synthetic::SyntheticSource;
pub use transform::{Quat, Transform, Vec3};

use crossbeam_channel::Receiver;

/// Channel capacity for sample batches.
pub const SAMPLE_CHANNEL_CAPACITY: usize = 8;

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Trait for body-tracking frame sources.
pub trait FrameSource: Send {
    /// Whether body tracking is available on the running hardware.
    fn is_supported(&self) -> bool;

    /// Start producing sample batches.
    fn start(&mut self) -> CaptureResult<Receiver<SampleBatch>>;

    /// Stop producing.
    fn stop(&mut self) -> CaptureResult<()>;

    /// Check if the source is active.
    fn is_active(&self) -> bool;

    /// Source name for diagnostics.
    fn name(&self) -> &str;
}
