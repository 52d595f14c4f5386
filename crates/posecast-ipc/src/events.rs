//! Events sent from the engine to the controller.

use serde::{Deserialize, Serialize};

use crate::state::{EngineState, GroupSessionState};
use crate::types::{ControlMessage, PipelineMetrics, WarningType};

/// Events that the engine can send to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Engine state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<EngineState>,

        /// Current state.
        current: Box<EngineState>,
    },

    /// The group session moved to a new lifecycle state.
    GroupStateChanged {
        previous: GroupSessionState,
        current: GroupSessionState,
    },

    /// Updated pipeline metrics.
    Metrics(PipelineMetrics),

    /// Performance warning detected.
    PerformanceWarning(WarningType),

    /// Error occurred.
    Error {
        /// Whether the error is recoverable.
        recoverable: bool,

        /// Error message.
        message: String,
    },

    /// Something arrived from a remote peer.
    Inbound(InboundEvent),

    /// Engine is ready.
    Ready,

    /// Engine has shut down.
    Shutdown,
}

/// Summary of an inbound message, as surfaced to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboundEvent {
    /// A side-channel control signal.
    Control { peer: String, message: ControlMessage },

    /// A telemetry frame was decoded.
    Frame { peer: String, bodies: usize, joints: usize },

    /// A single joint record arrived over a group messenger.
    Record { peer: String, body: String, joint: String },
}
