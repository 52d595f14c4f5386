//! Seams to the platform's group activity service.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_channel::Receiver;
use posecast_ipc::DeliveryMode;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::link::{PeerId, PeerPacket};
use crate::ChannelResult;

pub type SessionId = Uuid;

/// Opaque handle returned by a journal write.
pub type AttachmentId = Uuid;

/// Something that happened to a session we hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The number of joined participants changed.
    ParticipantsChanged(usize),

    /// The session ended.
    Invalidated { reason: String },
}

/// Result of asking the platform whether activation may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    Approved,
    /// No eligible context; the attempt ends here.
    Disabled,
    /// The user backed out.
    Cancelled,
}

/// Low-latency, best-effort messages within a session.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send to every other participant.
    async fn send(&self, payload: Bytes, mode: DeliveryMode) -> ChannelResult<usize>;

    /// Messages from other participants.
    fn incoming(&self) -> Receiver<PeerPacket>;
}

/// Ordered, durable attachments shared by a session.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn add(&self, payload: Bytes) -> ChannelResult<AttachmentId>;
}

/// One concrete session as seen by the local participant.
#[async_trait]
pub trait GroupSessionBackend: Send + Sync {
    fn id(&self) -> SessionId;

    fn local_participant(&self) -> &PeerId;

    async fn join(&self) -> ChannelResult<()>;

    async fn leave(&self);

    /// Joined participants, including the local one.
    fn active_participants(&self) -> usize;

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    fn messenger(&self) -> Arc<dyn Messenger>;

    fn journal(&self) -> Arc<dyn Journal>;
}

/// The shareable activity itself.
#[async_trait]
pub trait GroupActivity: Send + Sync {
    /// Ask whether activation may proceed. May wait on the user.
    async fn prepare_for_activation(&self) -> ActivationOutcome;

    /// Start the activity; a session is announced on [`sessions`](Self::sessions).
    async fn activate(&self) -> ChannelResult<()>;

    /// Sessions becoming available, local or remote.
    fn sessions(&self) -> broadcast::Receiver<Arc<dyn GroupSessionBackend>>;
}
