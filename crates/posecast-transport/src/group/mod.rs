//! Group activity sessions: lifecycle, handles and the group channel.
//!
//! A [`GroupActivity`] is the platform seam that offers activation and
//! announces sessions. The [`GroupSessionController`] drives the
//! [`GroupSessionState`](posecast_ipc::GroupSessionState) machine from a
//! single event queue and owns the messenger/journal handles that the
//! [`GroupChannel`] borrows for each send.

mod backend;
mod channel;
mod controller;
mod local;

pub use backend::{
    ActivationOutcome, AttachmentId, GroupActivity, GroupSessionBackend, Journal, Messenger,
    SessionEvent, SessionId,
};
pub use channel::GroupChannel;
pub use controller::{GroupSessionController, GroupStatus, GroupTransition};
pub use local::{LocalActivityHub, LocalParticipant};
