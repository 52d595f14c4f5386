//! Common types used across IPC messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest pacing frequency accepted by [`PipelineConfig::validate`].
pub const MAX_TARGET_HZ: u32 = 240;

/// How many tracked bodies the pipeline distributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyCount {
    /// Only the first body seen is distributed until it is retired.
    Single,

    /// Every tracked body is distributed.
    #[default]
    Multi,
}

/// Which distribution channel the pacer hands frames to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Broadcast to every currently connected peer.
    #[default]
    Direct,

    /// Messenger/journal of a joined group session.
    Group,
}

/// Delivery guarantee requested for a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Best effort, unordered; may drop.
    #[default]
    Unreliable,

    /// Delivered in order, or the send fails.
    Reliable,
}

/// Payload compression for the direct channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Off,
    On,
}

impl Compression {
    /// Returns true when payloads are compressed before transmission.
    pub fn is_enabled(self) -> bool {
        self == Self::On
    }
}

/// How the group channel splits a frame into messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupSendMode {
    /// One messenger message per joint record.
    #[default]
    Messenger,

    /// One journal attachment per body per tick.
    Journal,
}

/// Decimal place numeric fields are rounded to before encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundingPrecision {
    /// Keep the captured precision.
    #[default]
    Full,
    Ones,
    Tenths,
    Hundredths,
    Thousandths,
    TenThousandths,
}

impl RoundingPrecision {
    /// Widen a captured value to `f64`, rounding it if a precision is set.
    pub fn apply(self, value: f32) -> f64 {
        let value = f64::from(value);
        let scale = match self {
            Self::Full => return value,
            Self::Ones => 1.0,
            Self::Tenths => 10.0,
            Self::Hundredths => 100.0,
            Self::Thousandths => 1_000.0,
            Self::TenThousandths => 10_000.0,
        };
        (value * scale).round() / scale
    }
}

/// How joint record identifiers are generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordIdStrategy {
    /// Name-based UUID from body, joint index and timestamp.
    #[default]
    Derived,

    /// Fresh random UUID per record.
    Random,
}

/// Configuration for starting the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Single- or multi-body distribution.
    pub bodies: BodyCount,

    /// Distribution channel.
    pub channel: ChannelKind,

    /// Delivery mode for the direct channel and group messenger.
    pub delivery: DeliveryMode,

    /// Compression of direct channel payloads.
    pub compression: Compression,

    /// Message granularity on the group channel.
    pub group_send: GroupSendMode,

    /// Pacer frequency in Hz (default: 30).
    pub target_hz: u32,

    /// Dispatch every Nth pacer tick (default: 3).
    pub skip_frames: u32,

    /// Retire a body after this many consecutive untracked updates; 0 disables.
    pub retire_after_untracked: u32,

    /// Offset added to every anchor position, in meters.
    pub anchor_offset: [f32; 3],

    /// Numeric rounding applied by the encoder.
    pub precision: RoundingPrecision,

    /// Joint record identifier strategy.
    pub record_ids: RecordIdStrategy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bodies: BodyCount::Multi,
            channel: ChannelKind::Direct,
            delivery: DeliveryMode::Unreliable,
            compression: Compression::Off,
            group_send: GroupSendMode::Messenger,
            target_hz: 30,
            skip_frames: 3,
            retire_after_untracked: 90,
            anchor_offset: [0.0, 0.0, 0.0],
            precision: RoundingPrecision::Full,
            record_ids: RecordIdStrategy::Derived,
        }
    }
}

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("target_hz must be between 1 and {MAX_TARGET_HZ}, got {0}")]
    TargetHz(u32),

    #[error("skip_frames must be at least 1")]
    SkipFrames,
}

impl PipelineConfig {
    /// Check the numeric settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_hz == 0 || self.target_hz > MAX_TARGET_HZ {
            return Err(ConfigError::TargetHz(self.target_hz));
        }
        if self.skip_frames == 0 {
            return Err(ConfigError::SkipFrames);
        }
        Ok(())
    }

    /// Interval between two pacer ticks.
    pub fn tick_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.target_hz.max(1)))
    }
}

/// Real-time pipeline metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Pacer ticks since start.
    pub ticks: u64,

    /// Dispatches handed to the channel since start.
    pub dispatches: u64,

    /// Dispatches per second over the last report interval.
    pub dispatch_rate_hz: f32,

    /// Dispatches cancelled because a newer one became due.
    pub cancelled_dispatches: u64,

    /// Dispatches that ended in a channel error.
    pub failed_dispatches: u64,

    /// Sends that were a no-op (nobody to receive).
    pub skipped_sends: u64,

    /// Bodies skipped by the encoder.
    pub encode_drops: u64,

    /// Total payload bytes handed to the transport.
    pub bytes_sent: u64,

    /// Bodies currently held by the anchor manager.
    pub tracked_bodies: u64,

    /// Pipeline uptime in seconds.
    pub uptime_seconds: u64,
}

/// Types of performance warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WarningType {
    /// Dispatches are being superseded before they finish.
    DispatchBacklog { cancelled: u64 },

    /// The channel keeps failing.
    SendFailures { count: u64 },

    /// The encoder keeps rejecting samples.
    EncodeDrops { count: u64 },
}

/// A small keyed boolean signal received out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlMessage {
    pub key: String,
    pub value: bool,
}

impl ControlMessage {
    /// Key of the selection flag.
    pub const SELECTED: &'static str = "selected";

    /// Key of the frame-ready flag.
    pub const FRAME_READY: &'static str = "frameReady";

    /// Create a control message.
    pub fn new(key: impl Into<String>, value: bool) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}
