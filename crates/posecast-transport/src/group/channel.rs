//! Distribution over a joined group session.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use posecast_encoder::{JointSet, TrackedBodyFrame, WireCodec};
use posecast_ipc::{Compression, DeliveryMode, GroupSendMode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::backend::AttachmentId;
use super::controller::GroupSessionController;
use crate::channel::{DistributionChannel, InboundMessage, SendReport};
use crate::error::ChannelError;
use crate::history::HistoryBuffer;
use crate::ChannelResult;

/// Writes frames to the messenger or journal of the joined session.
///
/// Sending while no session is joined, or while the local participant is
/// alone, is a successful no-op.
pub struct GroupChannel {
    controller: Arc<GroupSessionController>,
    codec: WireCodec,
    mode: GroupSendMode,
    delivery: DeliveryMode,
    attachments: Mutex<HistoryBuffer<AttachmentId>>,
    received: Mutex<HistoryBuffer<Uuid>>,
}

impl GroupChannel {
    pub fn new(controller: Arc<GroupSessionController>, mode: GroupSendMode, delivery: DeliveryMode) -> Self {
        Self {
            controller,
            codec: WireCodec::new(Compression::Off),
            mode,
            delivery,
            attachments: Mutex::new(HistoryBuffer::default()),
            received: Mutex::new(HistoryBuffer::default()),
        }
    }

    pub fn controller(&self) -> &Arc<GroupSessionController> {
        &self.controller
    }

    /// Identifiers of recent journal attachments, oldest first.
    pub fn attachment_history(&self) -> Vec<AttachmentId> {
        self.attachments.lock().iter().copied().collect()
    }

    /// Identifiers of recently received records, oldest first.
    pub fn received_history(&self) -> Vec<Uuid> {
        self.received.lock().iter().copied().collect()
    }
}

#[async_trait]
impl DistributionChannel for GroupChannel {
    fn name(&self) -> &'static str {
        "group"
    }

    async fn send(
        &self,
        frame: &TrackedBodyFrame,
        cancel: &CancellationToken,
    ) -> ChannelResult<SendReport> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }

        let shared = self.controller.shared();
        let guard = shared.handles().await;
        let Some(handles) = guard.as_ref() else {
            debug!(state = %shared.state().name(), "Group session not joined, skipping send");
            return Ok(SendReport::skipped());
        };
        let participants = handles.session.active_participants();
        if participants <= 1 {
            debug!(participants, "No other participants, skipping send");
            return Ok(SendReport::skipped());
        }

        frame.validate()?;

        let mut report = SendReport {
            recipients: participants - 1,
            ..SendReport::default()
        };
        match self.mode {
            GroupSendMode::Messenger => {
                for record in frame.records() {
                    if cancel.is_cancelled() {
                        return Err(ChannelError::Cancelled);
                    }
                    let payload = self.codec.encode_record(record)?;
                    report.bytes_sent += handles.messenger.send(payload, self.delivery).await? as u64;
                    report.messages += 1;
                }
            }
            GroupSendMode::Journal => {
                for (body, records) in frame.bodies() {
                    if records.is_empty() {
                        continue;
                    }
                    if cancel.is_cancelled() {
                        return Err(ChannelError::Cancelled);
                    }
                    let payload = self.codec.encode_joint_set(&JointSet::from_records(records))?;
                    let size = payload.len() as u64;
                    let attachment = handles.journal.add(payload).await?;
                    trace!(%body, %attachment, "Journal attachment added");
                    self.attachments.lock().push(attachment);
                    report.bytes_sent += size;
                    report.messages += 1;
                }
            }
        }
        Ok(report)
    }

    fn poll_inbound(&self, max: usize) -> Vec<InboundMessage> {
        let shared = self.controller.shared();
        let Some(guard) = shared.try_handles() else {
            return Vec::new();
        };
        let Some(handles) = guard.as_ref() else {
            return Vec::new();
        };

        handles
            .messenger
            .incoming()
            .try_iter()
            .take(max)
            .filter_map(|packet| match self.codec.decode_record(&packet.payload) {
                Ok(record) => {
                    self.received.lock().push(record.id);
                    Some(InboundMessage::Record {
                        from: packet.from,
                        record,
                    })
                }
                Err(e) => {
                    debug!(from = %packet.from, error = %e, "Discarding undecodable record");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::backend::{
        ActivationOutcome, GroupActivity, GroupSessionBackend, Journal, Messenger, SessionEvent,
        SessionId,
    };
    use crate::group::LocalActivityHub;
    use crate::link::{PeerId, PeerPacket};
    use bytes::Bytes;
    use crossbeam_channel::Receiver;
    use posecast_capture::{CaptureTimestamp, RawBodySample, Transform, JOINT_COUNT};
    use posecast_encoder::PoseEncoder;
    use posecast_ipc::GroupSessionState;
    use std::time::Duration;
    use tokio::sync::{broadcast, Semaphore};

    fn frame(bodies: u128) -> TrackedBodyFrame {
        let mut frame = TrackedBodyFrame::new();
        for body in 0..bodies {
            let sample = RawBodySample::new(
                Uuid::from_u128(body + 1),
                vec![Transform::IDENTITY; JOINT_COUNT],
                true,
                Transform::IDENTITY,
                CaptureTimestamp::from_secs(2.0),
            );
            frame.insert(sample.body_id, PoseEncoder::default().encode(&sample, &sample.anchor));
        }
        frame
    }

    async fn wait_for_state(controller: &GroupSessionController, state: GroupSessionState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while controller.state() != state {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("state not reached");
    }

    async fn joined_pair(
        hub: &LocalActivityHub,
        mode: GroupSendMode,
    ) -> (GroupChannel, GroupChannel) {
        let alice = Arc::new(GroupSessionController::spawn(Arc::new(hub.participant("alice"))));
        let bob = Arc::new(GroupSessionController::spawn(Arc::new(hub.participant("bob"))));
        alice.prepare().unwrap();
        wait_for_state(&alice, GroupSessionState::Joined).await;
        wait_for_state(&bob, GroupSessionState::Joined).await;
        (
            GroupChannel::new(alice, mode, DeliveryMode::Unreliable),
            GroupChannel::new(bob, mode, DeliveryMode::Unreliable),
        )
    }

    #[tokio::test]
    async fn test_send_before_join_is_noop() {
        let hub = LocalActivityHub::new();
        let controller = Arc::new(GroupSessionController::spawn(Arc::new(hub.participant("alice"))));
        let channel = GroupChannel::new(controller, GroupSendMode::Messenger, DeliveryMode::Unreliable);

        let report = channel.send(&frame(1), &CancellationToken::new()).await.unwrap();
        assert!(report.is_skipped());
        assert_eq!(report.bytes_sent, 0);
    }

    #[tokio::test]
    async fn test_declined_activation_sends_nothing() {
        let hub = LocalActivityHub::new();
        hub.set_activation(ActivationOutcome::Disabled);
        let controller = Arc::new(GroupSessionController::spawn(Arc::new(hub.participant("alice"))));
        controller.prepare().unwrap();
        wait_for_state(&controller, GroupSessionState::ActivationDisabled).await;

        let channel = GroupChannel::new(Arc::clone(&controller), GroupSendMode::Journal, DeliveryMode::Unreliable);
        let report = channel.send(&frame(1), &CancellationToken::new()).await.unwrap();
        assert_eq!(report, SendReport::skipped());
        assert!(!controller.is_ready());
        assert_eq!(hub.journal_len(), 0);
    }

    #[tokio::test]
    async fn test_alone_in_session_is_noop() {
        let hub = LocalActivityHub::new();
        let controller = Arc::new(GroupSessionController::spawn(Arc::new(hub.participant("alice"))));
        controller.prepare().unwrap();
        wait_for_state(&controller, GroupSessionState::Joined).await;

        let channel = GroupChannel::new(controller, GroupSendMode::Journal, DeliveryMode::Unreliable);
        let report = channel.send(&frame(1), &CancellationToken::new()).await.unwrap();
        assert!(report.is_skipped());
        assert_eq!(hub.journal_len(), 0);
    }

    #[tokio::test]
    async fn test_messenger_sends_one_message_per_record() {
        let hub = LocalActivityHub::new();
        let (alice, bob) = joined_pair(&hub, GroupSendMode::Messenger).await;

        let report = alice.send(&frame(1), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.messages, JOINT_COUNT as u64);
        assert_eq!(report.recipients, 1);

        let inbound = bob.poll_inbound(usize::MAX);
        assert_eq!(inbound.len(), JOINT_COUNT);
        assert!(matches!(&inbound[0], InboundMessage::Record { record, .. } if record.metadata.index == 0));
        assert_eq!(bob.received_history().len(), crate::HISTORY_CAPACITY.min(JOINT_COUNT));
    }

    #[tokio::test]
    async fn test_journal_adds_one_attachment_per_body() {
        let hub = LocalActivityHub::new();
        let (alice, _bob) = joined_pair(&hub, GroupSendMode::Journal).await;

        let report = alice.send(&frame(2), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.messages, 2);
        assert_eq!(hub.journal_len(), 2);
        assert_eq!(alice.attachment_history().len(), 2);
    }

    #[tokio::test]
    async fn test_attachment_history_is_bounded() {
        let hub = LocalActivityHub::new();
        let (alice, _bob) = joined_pair(&hub, GroupSendMode::Journal).await;

        for _ in 0..60 {
            alice.send(&frame(2), &CancellationToken::new()).await.unwrap();
        }
        assert_eq!(hub.journal_len(), 120);
        assert_eq!(alice.attachment_history().len(), crate::HISTORY_CAPACITY);
    }

    /// A session whose messenger blocks until the test releases a permit.
    struct GatedSession {
        id: SessionId,
        peer: PeerId,
        gate: Arc<Semaphore>,
        events: broadcast::Sender<SessionEvent>,
        sent: Arc<Mutex<Vec<GroupSessionState>>>,
        observer: Arc<Mutex<Option<Arc<GroupSessionController>>>>,
        inbox: Receiver<PeerPacket>,
    }

    struct GatedMessenger {
        gate: Arc<Semaphore>,
        sent: Arc<Mutex<Vec<GroupSessionState>>>,
        observer: Arc<Mutex<Option<Arc<GroupSessionController>>>>,
        inbox: Receiver<PeerPacket>,
    }

    #[async_trait]
    impl Messenger for GatedMessenger {
        async fn send(&self, payload: Bytes, _mode: DeliveryMode) -> ChannelResult<usize> {
            let permit = self.gate.acquire().await.map_err(|_| ChannelError::Revoked)?;
            permit.forget();
            let state = self
                .observer
                .lock()
                .as_ref()
                .map(|controller| controller.state())
                .unwrap_or_default();
            self.sent.lock().push(state);
            Ok(payload.len())
        }

        fn incoming(&self) -> Receiver<PeerPacket> {
            self.inbox.clone()
        }
    }

    struct NullJournal;

    #[async_trait]
    impl Journal for NullJournal {
        async fn add(&self, _payload: Bytes) -> ChannelResult<AttachmentId> {
            Ok(Uuid::new_v4())
        }
    }

    #[async_trait]
    impl GroupSessionBackend for GatedSession {
        fn id(&self) -> SessionId {
            self.id
        }

        fn local_participant(&self) -> &PeerId {
            &self.peer
        }

        async fn join(&self) -> ChannelResult<()> {
            Ok(())
        }

        async fn leave(&self) {}

        fn active_participants(&self) -> usize {
            2
        }

        fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
            self.events.subscribe()
        }

        fn messenger(&self) -> Arc<dyn Messenger> {
            Arc::new(GatedMessenger {
                gate: Arc::clone(&self.gate),
                sent: Arc::clone(&self.sent),
                observer: Arc::clone(&self.observer),
                inbox: self.inbox.clone(),
            })
        }

        fn journal(&self) -> Arc<dyn Journal> {
            Arc::new(NullJournal)
        }
    }

    struct GatedActivity {
        sessions: broadcast::Sender<Arc<dyn GroupSessionBackend>>,
        session: Arc<GatedSession>,
    }

    #[async_trait]
    impl GroupActivity for GatedActivity {
        async fn prepare_for_activation(&self) -> ActivationOutcome {
            ActivationOutcome::Approved
        }

        async fn activate(&self) -> ChannelResult<()> {
            let session: Arc<dyn GroupSessionBackend> = self.session.clone();
            let _ = self.sessions.send(session);
            Ok(())
        }

        fn sessions(&self) -> broadcast::Receiver<Arc<dyn GroupSessionBackend>> {
            self.sessions.subscribe()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalidation_waits_for_in_flight_send() {
        let (_inbox_tx, inbox) = crossbeam_channel::bounded(1);
        let (events, _) = broadcast::channel(8);
        let (sessions, _) = broadcast::channel(8);
        let gate = Arc::new(Semaphore::new(0));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let observer = Arc::new(Mutex::new(None));
        let session = Arc::new(GatedSession {
            id: Uuid::new_v4(),
            peer: PeerId::new("alice"),
            gate: Arc::clone(&gate),
            events: events.clone(),
            sent: Arc::clone(&sent),
            observer: Arc::clone(&observer),
            inbox,
        });

        let controller = Arc::new(GroupSessionController::spawn(Arc::new(GatedActivity {
            sessions,
            session,
        })));
        *observer.lock() = Some(Arc::clone(&controller));
        controller.prepare().unwrap();
        wait_for_state(&controller, GroupSessionState::Joined).await;

        let channel = Arc::new(GroupChannel::new(
            Arc::clone(&controller),
            GroupSendMode::Messenger,
            DeliveryMode::Unreliable,
        ));

        let in_flight = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.send(&frame(1), &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = events.send(SessionEvent::Invalidated {
            reason: "transport torn down".into(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.state(), GroupSessionState::Joined);

        gate.add_permits(JOINT_COUNT);
        let report = in_flight.await.unwrap().unwrap();
        assert_eq!(report.messages, JOINT_COUNT as u64);

        wait_for_state(&controller, GroupSessionState::Invalidated).await;
        assert!(sent.lock().iter().all(|state| *state == GroupSessionState::Joined));

        let after = channel.send(&frame(1), &CancellationToken::new()).await.unwrap();
        assert!(after.is_skipped());
        assert_eq!(sent.lock().len(), JOINT_COUNT);

        *observer.lock() = None;
    }
}
