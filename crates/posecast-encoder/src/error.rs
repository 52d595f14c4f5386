//! Error types for the encoder module.

use thiserror::Error;

/// Errors that can occur while encoding or decoding telemetry.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The value could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The payload is not a well-formed message.
    #[error("Malformed payload: {0}")]
    Deserialize(#[source] serde_json::Error),

    /// A numeric field is NaN or infinite.
    #[error("Non-finite {field} in joint {joint}")]
    NonFinite { joint: String, field: &'static str },

    /// A record does not line up with the skeleton definition.
    #[error("Joint {index} is named {name:?}, expected {expected:?}")]
    SkeletonMismatch {
        index: u32,
        name: String,
        expected: &'static str,
    },

    /// Compression failed.
    #[error("Compression failed for {payload_size} byte payload")]
    CompressionFailed { payload_size: usize },

    /// Decompression failed.
    #[error("Decompression failed for {payload_size} byte payload")]
    DecompressionFailed { payload_size: usize },

    /// Nothing to decode.
    #[error("Empty payload")]
    EmptyPayload,
}
