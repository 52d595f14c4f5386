//! Error types for the engine.

use posecast_capture::CaptureError;
use posecast_ipc::ConfigError;
use posecast_transport::ChannelError;
use thiserror::Error;

/// Errors that can occur while starting or running the pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Body tracking is not available on this hardware.
    #[error("Body tracking is not supported on this device")]
    UnsupportedDevice,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Frame source failure.
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Channel failure.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The configured channel needs a collaborator that was not provided.
    #[error("No {0} was provided to the engine")]
    MissingCollaborator(&'static str),

    /// A startup phase ran without its prerequisite.
    #[error("Phase {0} ran before its prerequisites")]
    PhaseOrder(&'static str),

    /// Runtime or thread creation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Fatal errors put the engine in a non-recoverable state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedDevice | Self::Capture(CaptureError::UnsupportedDevice)
        )
    }
}
