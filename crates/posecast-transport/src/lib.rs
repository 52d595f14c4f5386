//! Distribution channels for pose telemetry.
//!
//! Two channels share the [`DistributionChannel`] interface: a direct
//! broadcast to every connected peer over a [`PeerLink`], and a group
//! channel that writes to the messenger or journal of a joined group
//! session. The group session lifecycle lives in [`group`].

mod channel;
mod direct;
mod error;
pub mod group;
mod history;
pub mod link;

pub use channel::{DistributionChannel, InboundMessage, SendReport};
pub use direct::DirectPeerChannel;
pub use error::{ChannelError, ErrorKind};
pub use group::{
    ActivationOutcome, AttachmentId, GroupActivity, GroupChannel, GroupSessionBackend,
    GroupSessionController, GroupStatus, GroupTransition, Journal, LocalActivityHub,
    LocalParticipant, Messenger, SessionEvent, SessionId,
};
pub use history::HistoryBuffer;
pub use link::{LoopbackLink, LoopbackNetwork, PeerId, PeerLink, PeerPacket, UdpPeerLink};

/// Capacity of every [`HistoryBuffer`].
pub const HISTORY_CAPACITY: usize = 100;

/// Queue depth for inbound packets per link.
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Largest UDP payload, envelope included.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Payload bytes per fragment when a message does not fit one datagram.
pub const FRAGMENT_CHUNK_SIZE: usize = 16 * 1024;

/// Largest message a link reassembles from fragments.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Queue depth for group session events.
pub const SESSION_EVENT_CAPACITY: usize = 32;

/// How long a reliable send waits for a full peer queue.
pub const RELIABLE_SEND_TIMEOUT_MS: u64 = 250;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
