//! Commands sent from the controller to the engine.

use serde::{Deserialize, Serialize};

use crate::types::PipelineConfig;

/// Commands that a controller can send to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineCommand {
    /// Start the capture/pace/distribute pipeline with the given configuration.
    Start { config: PipelineConfig },

    /// Stop the running pipeline.
    Stop,

    /// Make this device discoverable on the direct peer link.
    StartAdvertising,

    /// Stop accepting new peers on the direct peer link.
    StopAdvertising,

    /// Ask the group activity to prepare for activation and activate it.
    ShareActivity,

    /// Leave the current group session and return to `Unconfigured`.
    LeaveActivity,

    /// Request current engine state.
    GetState,

    /// Shutdown the engine completely.
    Shutdown,
}
