//! Group session lifecycle driver.

use std::sync::Arc;

use parking_lot::Mutex;
use posecast_ipc::{GroupSessionState, GroupTrigger};
use tokio::sync::{broadcast, mpsc, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::backend::{
    ActivationOutcome, GroupActivity, GroupSessionBackend, Journal, Messenger, SessionEvent,
    SessionId,
};
use crate::error::ChannelError;
use crate::{ChannelResult, SESSION_EVENT_CAPACITY};

/// Snapshot of the group session as seen by the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStatus {
    pub state: GroupSessionState,
    pub is_activated: bool,
    pub is_ready: bool,
    pub session: Option<SessionId>,
}

/// One applied state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupTransition {
    pub previous: GroupSessionState,
    pub current: GroupSessionState,
}

/// Messenger and journal of the joined session, always replaced together.
pub(crate) struct GroupHandles {
    pub session: Arc<dyn GroupSessionBackend>,
    pub messenger: Arc<dyn Messenger>,
    pub journal: Arc<dyn Journal>,
}

pub(crate) struct Shared {
    status: Mutex<GroupStatus>,
    handles: RwLock<Option<GroupHandles>>,
    transitions: broadcast::Sender<GroupTransition>,
}

impl Shared {
    fn transition(&self, trigger: GroupTrigger, session: Option<SessionId>) -> Option<GroupTransition> {
        let transition = {
            let mut status = self.status.lock();
            let current = status.state.on(trigger)?;
            let previous = status.state;
            *status = GroupStatus {
                state: current,
                is_activated: matches!(current, GroupSessionState::Activated | GroupSessionState::Joined),
                is_ready: current.is_joined(),
                session: session.filter(|_| current.is_joined()),
            };
            GroupTransition { previous, current }
        };

        if transition.previous != transition.current {
            debug!(
                previous = %transition.previous.name(),
                current = %transition.current.name(),
                ?trigger,
                "Group session transition"
            );
            let _ = self.transitions.send(transition);
        }
        Some(transition)
    }

    /// Shared access to the handles; revocation waits for every holder.
    pub(crate) async fn handles(&self) -> RwLockReadGuard<'_, Option<GroupHandles>> {
        self.handles.read().await
    }

    pub(crate) fn try_handles(&self) -> Option<RwLockReadGuard<'_, Option<GroupHandles>>> {
        self.handles.try_read().ok()
    }

    pub(crate) fn state(&self) -> GroupSessionState {
        self.status.lock().state
    }
}

enum ControlEvent {
    Prepare,
    Prepared(ActivationOutcome),
    ActivationFailed(String),
    Discovered(Arc<dyn GroupSessionBackend>),
    Session { id: SessionId, event: SessionEvent },
    Leave,
}

/// Owns the group session state and the handles derived from it.
///
/// Every input (local requests, activation results, discovered sessions and
/// backend events) is applied in order by one driver task.
pub struct GroupSessionController {
    shared: Arc<Shared>,
    events: mpsc::Sender<ControlEvent>,
    cancel: CancellationToken,
}

impl GroupSessionController {
    /// Start the driver on the current tokio runtime.
    pub fn spawn(activity: Arc<dyn GroupActivity>) -> Self {
        let (events, events_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        let (transitions, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            status: Mutex::new(GroupStatus::default()),
            handles: RwLock::new(None),
            transitions,
        });
        let cancel = CancellationToken::new();

        tokio::spawn(discover(activity.sessions(), events.clone(), cancel.clone()));

        let driver = Driver {
            shared: Arc::clone(&shared),
            activity,
            events: events.clone(),
            forwarder: None,
            cancel: cancel.clone(),
        };
        tokio::spawn(driver.run(events_rx));

        Self {
            shared,
            events,
            cancel,
        }
    }

    pub fn status(&self) -> GroupStatus {
        *self.shared.status.lock()
    }

    pub fn state(&self) -> GroupSessionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.status.lock().is_ready
    }

    pub fn is_activated(&self) -> bool {
        self.shared.status.lock().is_activated
    }

    /// State changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupTransition> {
        self.shared.transitions.subscribe()
    }

    /// Request activation of the shared activity.
    pub fn prepare(&self) -> ChannelResult<()> {
        self.post(ControlEvent::Prepare)
    }

    /// Leave any joined session and return to `Unconfigured`.
    pub fn leave(&self) -> ChannelResult<()> {
        self.post(ControlEvent::Leave)
    }

    /// Stop the driver, leaving any joined session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    fn post(&self, event: ControlEvent) -> ChannelResult<()> {
        self.events
            .try_send(event)
            .map_err(|_| ChannelError::ChannelDisconnected)
    }
}

impl Drop for GroupSessionController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    shared: Arc<Shared>,
    activity: Arc<dyn GroupActivity>,
    events: mpsc::Sender<ControlEvent>,
    forwarder: Option<CancellationToken>,
    cancel: CancellationToken,
}

impl Driver {
    #[instrument(name = "group_driver", skip_all)]
    async fn run(mut self, mut events: mpsc::Receiver<ControlEvent>) {
        debug!("Group session driver started");
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }

        self.release(GroupTrigger::Teardown).await;
        debug!("Group session driver stopped");
    }

    async fn handle(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Prepare => {
                if self.shared.transition(GroupTrigger::PrepareRequested, None).is_none() {
                    debug!(state = %self.shared.state().name(), "Ignoring prepare request");
                    return;
                }
                let activity = Arc::clone(&self.activity);
                let events = self.events.clone();
                tokio::spawn(async move {
                    let outcome = activity.prepare_for_activation().await;
                    let _ = events.send(ControlEvent::Prepared(outcome)).await;
                });
            }
            ControlEvent::Prepared(ActivationOutcome::Approved) => {
                if self.shared.transition(GroupTrigger::ActivationApproved, None).is_none() {
                    return;
                }
                let activity = Arc::clone(&self.activity);
                let events = self.events.clone();
                tokio::spawn(async move {
                    if let Err(e) = activity.activate().await {
                        let _ = events.send(ControlEvent::ActivationFailed(e.to_string())).await;
                    }
                });
            }
            ControlEvent::Prepared(ActivationOutcome::Disabled) => {
                info!("Activation disabled by the environment");
                self.shared.transition(GroupTrigger::ActivationDisabled, None);
            }
            ControlEvent::Prepared(ActivationOutcome::Cancelled) => {
                self.shared.transition(GroupTrigger::ActivationCancelled, None);
            }
            ControlEvent::ActivationFailed(message) => {
                warn!("Activation failed: {}", message);
                if self.shared.state() == GroupSessionState::Activated {
                    self.shared.transition(GroupTrigger::Teardown, None);
                }
            }
            ControlEvent::Discovered(session) => self.join(session).await,
            ControlEvent::Session { id, event } => {
                if self.shared.status.lock().session != Some(id) {
                    trace!(session = %id, "Event from stale session");
                    return;
                }
                match event {
                    SessionEvent::ParticipantsChanged(count) => {
                        debug!(session = %id, count, "Participants changed");
                    }
                    SessionEvent::Invalidated { reason } => {
                        info!(session = %id, %reason, "Session invalidated");
                        self.release(GroupTrigger::Invalidated).await;
                    }
                }
            }
            ControlEvent::Leave => self.release(GroupTrigger::Teardown).await,
        }
    }

    #[instrument(name = "group_join", skip_all, fields(session = %session.id()))]
    async fn join(&mut self, session: Arc<dyn GroupSessionBackend>) {
        let id = session.id();
        let current = *self.shared.status.lock();
        if current.session == Some(id) {
            debug!("Session already joined");
            return;
        }
        if current.state.is_joined() {
            self.release(GroupTrigger::Teardown).await;
        }

        let backend_events = session.subscribe();
        if let Err(e) = session.join().await {
            warn!("Failed to join session: {}", e);
            return;
        }

        let handles = GroupHandles {
            messenger: session.messenger(),
            journal: session.journal(),
            session,
        };
        {
            let mut slot = self.shared.handles.write().await;
            *slot = Some(handles);
            self.shared.transition(GroupTrigger::Joined, Some(id));
        }

        let token = self.cancel.child_token();
        tokio::spawn(forward(backend_events, id, self.events.clone(), token.clone()));
        self.forwarder = Some(token);
        info!("Joined group session");
    }

    /// Revoke handles and apply `trigger` under the exclusive lock.
    async fn release(&mut self, trigger: GroupTrigger) {
        if let Some(token) = self.forwarder.take() {
            token.cancel();
        }

        let handles = {
            let mut slot = self.shared.handles.write().await;
            let handles = slot.take();
            self.shared.transition(trigger, None);
            handles
        };

        if trigger == GroupTrigger::Teardown {
            if let Some(handles) = handles {
                handles.session.leave().await;
            }
        }
    }
}

async fn discover(
    mut sessions: broadcast::Receiver<Arc<dyn GroupSessionBackend>>,
    events: mpsc::Sender<ControlEvent>,
    cancel: CancellationToken,
) {
    loop {
        let session = tokio::select! {
            _ = cancel.cancelled() => break,
            session = sessions.recv() => session,
        };
        match session {
            Ok(session) => {
                if events.send(ControlEvent::Discovered(session)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed announced sessions");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn forward(
    mut backend_events: broadcast::Receiver<SessionEvent>,
    id: SessionId,
    events: mpsc::Sender<ControlEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = backend_events.recv() => event,
        };
        match event {
            Ok(event) => {
                if events.send(ControlEvent::Session { id, event }).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed session events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    trace!(session = %id, "Session event forwarder stopped");
}
