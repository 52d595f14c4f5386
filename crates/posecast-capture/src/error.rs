//! Error types for the capture module.

use thiserror::Error;

/// Errors that can occur during capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Body tracking is not available on this hardware.
    #[error("Body tracking is not supported on this device")]
    UnsupportedDevice,

    /// Capture already started.
    #[error("Capture already started")]
    AlreadyStarted,

    /// Capture not started.
    #[error("Capture not started")]
    NotStarted,

    /// The consumer is behind; the batch was dropped.
    #[error("Sample batch dropped: consumer is behind")]
    BatchDropped,

    /// Channel send error.
    #[error("Failed to send samples: channel disconnected")]
    ChannelDisconnected,

    /// Worker thread could not be spawned.
    #[error("Failed to spawn capture thread: {0}")]
    Thread(#[from] std::io::Error),
}
