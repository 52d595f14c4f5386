//! Error types for the distribution channels.

use posecast_encoder::EncoderError;
use posecast_ipc::{DeliveryMode, GroupSessionState};
use thiserror::Error;

/// Errors that can occur while distributing a frame.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The frame could not be encoded; it is dropped.
    #[error("Encode failed: {0}")]
    Encode(#[from] EncoderError),

    /// Nobody is connected.
    #[error("No connected peers")]
    NoConnectedPeers,

    /// The operation needs a joined group session.
    #[error("Group session not joined (state: {state:?})")]
    NotJoined { state: GroupSessionState },

    /// The group session was revoked while the operation was waiting.
    #[error("Group session handles revoked")]
    Revoked,

    /// Underlying send failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The link cannot honor the requested delivery mode.
    #[error("Delivery mode {0:?} is not supported by this link")]
    UnsupportedDelivery(DeliveryMode),

    /// Payload exceeds what the link can carry in one message.
    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The peer is not connected to this link.
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Advertising is required to accept the connection.
    #[error("Peer is not advertising")]
    NotAdvertising,

    /// Cancelled before any network write.
    #[error("Send cancelled")]
    Cancelled,

    /// Channel disconnected.
    #[error("Channel disconnected")]
    ChannelDisconnected,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers deciding how loudly to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The payload was not representable.
    Encode,
    /// Network or peer problem.
    Transport,
    /// The group session is not in a usable state.
    SessionState,
    /// The dispatch was superseded.
    Cancelled,
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Encode(_) => ErrorKind::Encode,
            Self::NotJoined { .. } | Self::Revoked => ErrorKind::SessionState,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NoConnectedPeers
            | Self::SendFailed(_)
            | Self::UnsupportedDelivery(_)
            | Self::PayloadTooLarge { .. }
            | Self::UnknownPeer(_)
            | Self::NotAdvertising
            | Self::ChannelDisconnected
            | Self::Io(_) => ErrorKind::Transport,
        }
    }

    /// Expected conditions that are logged at debug level only.
    pub fn is_steady_state(&self) -> bool {
        matches!(
            self,
            Self::NoConnectedPeers | Self::NotJoined { .. } | Self::Revoked | Self::Cancelled
        )
    }
}
