//! Surfaces messages received from remote devices as engine events.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use posecast_ipc::{EngineEvent, InboundEvent};
use posecast_transport::{DistributionChannel, InboundMessage};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{INBOUND_BATCH, INBOUND_POLL_INTERVAL_MS};

/// Condense a decoded message into the event shown to the controller.
pub fn summarize(message: &InboundMessage) -> InboundEvent {
    match message {
        InboundMessage::Frame { from, frame } => InboundEvent::Frame {
            peer: from.to_string(),
            bodies: frame.len(),
            joints: frame.joint_count(),
        },
        InboundMessage::Record { from, record } => InboundEvent::Record {
            peer: from.to_string(),
            body: record.metadata.body_id.to_string(),
            joint: record.metadata.name.clone(),
        },
        InboundMessage::Control { from, message } => InboundEvent::Control {
            peer: from.to_string(),
            message: message.clone(),
        },
    }
}

/// Background task polling a channel's inbound queue.
pub struct InboundPump {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl InboundPump {
    pub fn spawn(runtime: &Handle, channel: Arc<dyn DistributionChannel>, events: Sender<EngineEvent>) -> Self {
        let stop = CancellationToken::new();
        let handle = runtime.spawn(pump(channel, events, stop.clone()));
        Self { stop, handle }
    }

    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}

async fn pump(channel: Arc<dyn DistributionChannel>, events: Sender<EngineEvent>, stop: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_millis(INBOUND_POLL_INTERVAL_MS));
    let mut received = 0u64;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                for message in channel.poll_inbound(INBOUND_BATCH) {
                    received += 1;
                    let event = summarize(&message);
                    trace!(?event, "Inbound message");
                    if events.try_send(EngineEvent::Inbound(event)).is_err() {
                        warn!("Failed to forward inbound message");
                    }
                }
            }
        }
    }

    debug!(channel = channel.name(), received, "Inbound pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use posecast_ipc::ControlMessage;
    use posecast_transport::PeerId;

    #[test]
    fn test_control_summary_keeps_message() {
        let message = InboundMessage::Control {
            from: PeerId::new("bob"),
            message: ControlMessage::new(ControlMessage::SELECTED, true),
        };

        match summarize(&message) {
            InboundEvent::Control { peer, message } => {
                assert_eq!(peer, "bob");
                assert_eq!(message.key, "selected");
                assert!(message.value);
            }
            other => panic!("unexpected summary {:?}", other),
        }
    }
}
