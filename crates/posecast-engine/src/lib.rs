//! Core orchestrator for posecast.
//!
//! This crate wires a frame source, the pose encoder and a distribution
//! channel into one pipeline: a capture worker keeps the latest encoded
//! frame per body in a shared buffer, and a fixed-rate pacer hands
//! snapshots of that buffer to the channel. The [`Engine`] drives the
//! pipeline from [`EngineCommand`]s and reports back through
//! [`EngineEvent`]s.

mod anchors;
mod buffer;
mod capture;
mod error;
mod inbound;
mod metrics;
mod orchestrator;
mod pacer;
mod state;

pub use anchors::{AnchorEntry, AnchorLifecycleManager, CharacterTemplate, TemplateSlot, VisualHandle};
pub use buffer::SharedFrameBuffer;
pub use capture::{CapturePipeline, CaptureWorker};
pub use error::EngineError;
pub use inbound::{summarize, InboundPump};
pub use metrics::MetricsCollector;
pub use orchestrator::{Engine, EngineParts};
pub use pacer::{FramePacer, PacerState, PacerStatus, PacerTask, Throttle};
pub use state::{Collaborators, PipelineResources, ResourceManager};

use crossbeam_channel::{Receiver, Sender};
use posecast_ipc::{EngineCommand, EngineEvent};

/// Interval between metrics reports while live.
pub const METRICS_INTERVAL_MS: u64 = 1_000;

/// How often received messages are drained into events.
pub const INBOUND_POLL_INTERVAL_MS: u64 = 20;

/// Maximum messages drained per inbound poll.
pub const INBOUND_BATCH: usize = 64;

/// Upper bound on waiting for a pipeline task to stop.
pub const SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Create an engine instance with IPC channels.
pub fn create_engine(
    parts: EngineParts,
    command_rx: Receiver<EngineCommand>,
    event_tx: Sender<EngineEvent>,
) -> Result<Engine, EngineError> {
    Engine::new(parts, command_rx, event_tx)
}
