//! Typed controller<->engine messages for posecast.
//!
//! This crate defines the message types used between a controlling
//! front-end (the CLI, or an embedding application) and the pipeline
//! engine, plus the configuration and state enums both sides share.

mod commands;
mod events;
mod state;
mod types;

pub use commands::EngineCommand;
pub use events::{EngineEvent, InboundEvent};
pub use state::{EngineState, GroupSessionState, GroupTrigger, ShutdownPhase, StartupPhase, StopReason};
pub use types::{
    BodyCount, ChannelKind, Compression, ConfigError, ControlMessage, DeliveryMode,
    GroupSendMode, PipelineConfig, PipelineMetrics, RecordIdStrategy, RoundingPrecision,
    WarningType, MAX_TARGET_HZ,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for commands (controller → engine).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (engine → controller).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<EngineCommand>, Receiver<EngineCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<EngineEvent>, Receiver<EngineEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
