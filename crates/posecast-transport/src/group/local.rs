//! In-process group activity service.
//!
//! Every [`LocalParticipant`] registered on a [`LocalActivityHub`] sees the
//! sessions activated by any participant, so several pipelines in one
//! process can share an activity the way separate devices would.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use posecast_ipc::DeliveryMode;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::backend::{
    ActivationOutcome, AttachmentId, GroupActivity, GroupSessionBackend, Journal, Messenger,
    SessionEvent, SessionId,
};
use crate::error::ChannelError;
use crate::link::{PeerId, PeerPacket};
use crate::{ChannelResult, INBOUND_CHANNEL_CAPACITY, SESSION_EVENT_CAPACITY};

struct SessionCore {
    id: SessionId,
    members: Mutex<BTreeMap<PeerId, Sender<PeerPacket>>>,
    events: broadcast::Sender<SessionEvent>,
    journal: Mutex<Vec<(AttachmentId, Bytes)>>,
    ended: AtomicBool,
}

impl SessionCore {
    fn new() -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            members: Mutex::new(BTreeMap::new()),
            events,
            journal: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        }
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    fn announce_members(&self, count: usize) {
        let _ = self.events.send(SessionEvent::ParticipantsChanged(count));
    }
}

struct HubInner {
    activation: Mutex<ActivationOutcome>,
    participants: Mutex<Vec<(PeerId, broadcast::Sender<Arc<dyn GroupSessionBackend>>)>>,
    session: Mutex<Option<Arc<SessionCore>>>,
}

/// Shared activity service for in-process participants.
#[derive(Clone)]
pub struct LocalActivityHub {
    inner: Arc<HubInner>,
}

impl Default for LocalActivityHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalActivityHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                activation: Mutex::new(ActivationOutcome::Approved),
                participants: Mutex::new(Vec::new()),
                session: Mutex::new(None),
            }),
        }
    }

    /// Register a participant.
    pub fn participant(&self, name: impl Into<String>) -> LocalParticipant {
        let peer = PeerId::new(name);
        let (sessions, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        self.inner
            .participants
            .lock()
            .push((peer.clone(), sessions.clone()));
        LocalParticipant {
            hub: Arc::clone(&self.inner),
            peer,
            sessions,
        }
    }

    /// Outcome every subsequent activation request receives.
    pub fn set_activation(&self, outcome: ActivationOutcome) {
        *self.inner.activation.lock() = outcome;
    }

    /// End the running session for every participant.
    pub fn end_session(&self, reason: impl Into<String>) {
        let Some(core) = self.inner.session.lock().take() else {
            return;
        };
        core.ended.store(true, Ordering::SeqCst);
        core.members.lock().clear();
        let reason = reason.into();
        info!(session = %core.id, %reason, "Session ended");
        let _ = core.events.send(SessionEvent::Invalidated { reason });
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.inner.session.lock().as_ref().map(|core| core.id)
    }

    /// Attachments written to the running session's journal.
    pub fn journal_len(&self) -> usize {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|core| core.journal.lock().len())
            .unwrap_or(0)
    }

    /// Joined participants of the running session.
    pub fn joined(&self) -> usize {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|core| core.members.lock().len())
            .unwrap_or(0)
    }
}

impl HubInner {
    fn activate(&self) -> Arc<SessionCore> {
        let core = {
            let mut session = self.session.lock();
            match session.as_ref() {
                Some(core) if !core.is_ended() => Arc::clone(core),
                _ => {
                    let core = Arc::new(SessionCore::new());
                    *session = Some(Arc::clone(&core));
                    info!(session = %core.id, "Session created");
                    core
                }
            }
        };

        for (peer, sessions) in self.participants.lock().iter() {
            let handle: Arc<dyn GroupSessionBackend> = Arc::new(LocalSession::new(
                Arc::clone(&core),
                peer.clone(),
            ));
            if sessions.send(handle).is_err() {
                trace!(%peer, "Participant is not listening for sessions");
            }
        }
        core
    }
}

/// One participant's view of a [`LocalActivityHub`].
pub struct LocalParticipant {
    hub: Arc<HubInner>,
    peer: PeerId,
    sessions: broadcast::Sender<Arc<dyn GroupSessionBackend>>,
}

impl LocalParticipant {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }
}

#[async_trait]
impl GroupActivity for LocalParticipant {
    async fn prepare_for_activation(&self) -> ActivationOutcome {
        *self.hub.activation.lock()
    }

    async fn activate(&self) -> ChannelResult<()> {
        let core = self.hub.activate();
        debug!(peer = %self.peer, session = %core.id, "Activation issued");
        Ok(())
    }

    fn sessions(&self) -> broadcast::Receiver<Arc<dyn GroupSessionBackend>> {
        self.sessions.subscribe()
    }
}

struct LocalSession {
    core: Arc<SessionCore>,
    participant: PeerId,
    inbox_tx: Sender<PeerPacket>,
    inbox_rx: Receiver<PeerPacket>,
}

impl LocalSession {
    fn new(core: Arc<SessionCore>, participant: PeerId) -> Self {
        let (inbox_tx, inbox_rx) = crossbeam_channel::bounded(INBOUND_CHANNEL_CAPACITY);
        Self {
            core,
            participant,
            inbox_tx,
            inbox_rx,
        }
    }
}

#[async_trait]
impl GroupSessionBackend for LocalSession {
    fn id(&self) -> SessionId {
        self.core.id
    }

    fn local_participant(&self) -> &PeerId {
        &self.participant
    }

    async fn join(&self) -> ChannelResult<()> {
        if self.core.is_ended() {
            return Err(ChannelError::Revoked);
        }
        let count = {
            let mut members = self.core.members.lock();
            members.insert(self.participant.clone(), self.inbox_tx.clone());
            members.len()
        };
        debug!(peer = %self.participant, session = %self.core.id, count, "Joined session");
        self.core.announce_members(count);
        Ok(())
    }

    async fn leave(&self) {
        let count = {
            let mut members = self.core.members.lock();
            if members.remove(&self.participant).is_none() {
                return;
            }
            members.len()
        };
        debug!(peer = %self.participant, session = %self.core.id, count, "Left session");
        self.core.announce_members(count);
    }

    fn active_participants(&self) -> usize {
        self.core.members.lock().len()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.events.subscribe()
    }

    fn messenger(&self) -> Arc<dyn Messenger> {
        Arc::new(LocalMessenger {
            core: Arc::clone(&self.core),
            from: self.participant.clone(),
            inbox: self.inbox_rx.clone(),
        })
    }

    fn journal(&self) -> Arc<dyn Journal> {
        Arc::new(LocalJournal {
            core: Arc::clone(&self.core),
        })
    }
}

struct LocalMessenger {
    core: Arc<SessionCore>,
    from: PeerId,
    inbox: Receiver<PeerPacket>,
}

#[async_trait]
impl Messenger for LocalMessenger {
    async fn send(&self, payload: Bytes, mode: DeliveryMode) -> ChannelResult<usize> {
        if self.core.is_ended() {
            return Err(ChannelError::Revoked);
        }
        let recipients: Vec<(PeerId, Sender<PeerPacket>)> = self
            .core
            .members
            .lock()
            .iter()
            .filter(|(peer, _)| **peer != self.from)
            .map(|(peer, inbox)| (peer.clone(), inbox.clone()))
            .collect();

        let mut written = 0;
        for (peer, inbox) in recipients {
            let packet = PeerPacket {
                from: self.from.clone(),
                payload: payload.clone(),
            };
            match inbox.try_send(packet) {
                Ok(()) => written += payload.len(),
                Err(TrySendError::Full(_)) if mode == DeliveryMode::Unreliable => {
                    trace!(%peer, "Messenger inbox full, message dropped");
                }
                Err(TrySendError::Full(_)) => {
                    return Err(ChannelError::SendFailed(format!("{peer} inbox full")));
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        Ok(written)
    }

    fn incoming(&self) -> Receiver<PeerPacket> {
        self.inbox.clone()
    }
}

struct LocalJournal {
    core: Arc<SessionCore>,
}

#[async_trait]
impl Journal for LocalJournal {
    async fn add(&self, payload: Bytes) -> ChannelResult<AttachmentId> {
        if self.core.is_ended() {
            return Err(ChannelError::Revoked);
        }
        let id = Uuid::new_v4();
        self.core.journal.lock().push((id, payload));
        Ok(id)
    }
}
