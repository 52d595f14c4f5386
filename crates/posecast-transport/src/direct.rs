//! Broadcast of whole frames to every connected peer.

use std::sync::Arc;

use async_trait::async_trait;
use posecast_encoder::{TrackedBodyFrame, WireCodec};
use posecast_ipc::{Compression, ControlMessage, DeliveryMode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::{DistributionChannel, InboundMessage, SendReport};
use crate::error::ChannelError;
use crate::link::{PeerLink, PeerPacket};
use crate::ChannelResult;

/// Sends each frame as one payload to all currently connected peers.
pub struct DirectPeerChannel {
    link: Arc<dyn PeerLink>,
    codec: WireCodec,
    delivery: DeliveryMode,
}

impl DirectPeerChannel {
    pub fn new(link: Arc<dyn PeerLink>, compression: Compression, delivery: DeliveryMode) -> Self {
        Self {
            link,
            codec: WireCodec::new(compression),
            delivery,
        }
    }

    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    /// Send a control signal to every connected peer.
    pub async fn send_control(
        &self,
        message: &ControlMessage,
        cancel: &CancellationToken,
    ) -> ChannelResult<SendReport> {
        let payload = self.codec.encode_control(message)?;
        self.broadcast(payload, cancel).await
    }

    /// Decode a payload as a control message, falling back to a frame.
    pub fn decode_inbound(&self, packet: &PeerPacket) -> ChannelResult<InboundMessage> {
        if let Ok(message) = self.codec.decode_control(&packet.payload) {
            return Ok(InboundMessage::Control {
                from: packet.from.clone(),
                message,
            });
        }
        let frame = self.codec.decode_frame(&packet.payload)?;
        Ok(InboundMessage::Frame {
            from: packet.from.clone(),
            frame,
        })
    }

    async fn broadcast(
        &self,
        payload: bytes::Bytes,
        cancel: &CancellationToken,
    ) -> ChannelResult<SendReport> {
        let peers = self.link.connected_peers();
        if peers.is_empty() {
            return Err(ChannelError::NoConnectedPeers);
        }

        let mut report = SendReport::default();
        let mut last_error = None;
        for peer in &peers {
            if cancel.is_cancelled() {
                return Err(ChannelError::Cancelled);
            }
            match self.link.send_to(peer, payload.clone(), self.delivery).await {
                Ok(bytes) => {
                    report.bytes_sent += bytes as u64;
                    report.messages += 1;
                    report.recipients += 1;
                }
                Err(e) => {
                    debug!(%peer, error = %e, "Send to peer failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if report.recipients == 0 => Err(e),
            Some(e) => {
                warn!(
                    delivered = report.recipients,
                    peers = peers.len(),
                    "Partial delivery: {}",
                    e
                );
                Ok(report)
            }
            None => Ok(report),
        }
    }
}

#[async_trait]
impl DistributionChannel for DirectPeerChannel {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn send(
        &self,
        frame: &TrackedBodyFrame,
        cancel: &CancellationToken,
    ) -> ChannelResult<SendReport> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        let payload = self.codec.encode_frame(frame)?;
        trace!(bodies = frame.len(), bytes = payload.len(), "Frame encoded");
        self.broadcast(payload, cancel).await
    }

    fn poll_inbound(&self, max: usize) -> Vec<InboundMessage> {
        self.link
            .incoming()
            .try_iter()
            .take(max)
            .filter_map(|packet| match self.decode_inbound(&packet) {
                Ok(message) => Some(message),
                Err(e) => {
                    debug!(from = %packet.from, error = %e, "Discarding undecodable payload");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LoopbackNetwork, UdpPeerLink};
    use crate::MAX_DATAGRAM_SIZE;
    use posecast_capture::{
        CaptureTimestamp, RawBodySample, SyntheticSource, Transform, JOINT_COUNT,
    };
    use posecast_encoder::PoseEncoder;
    use posecast_ipc::PipelineConfig;
    use std::time::Duration;
    use uuid::Uuid;

    fn frame() -> TrackedBodyFrame {
        let sample = RawBodySample::new(
            Uuid::new_v4(),
            vec![Transform::IDENTITY; JOINT_COUNT],
            true,
            Transform::IDENTITY,
            CaptureTimestamp::from_secs(1.0),
        );
        let mut frame = TrackedBodyFrame::new();
        frame.insert(sample.body_id, PoseEncoder::default().encode(&sample, &sample.anchor));
        frame
    }

    fn pair(network: &LoopbackNetwork) -> (Arc<dyn PeerLink>, Arc<dyn PeerLink>) {
        let a = network.join("a");
        let b = network.join("b");
        b.start_advertising().unwrap();
        a.connect(b.local_peer()).unwrap();
        (Arc::new(a), Arc::new(b))
    }

    #[tokio::test]
    async fn test_no_peers_is_typed_error() {
        let network = LoopbackNetwork::new();
        let channel = DirectPeerChannel::new(
            Arc::new(network.join("alone")),
            Compression::Off,
            DeliveryMode::Unreliable,
        );

        let result = channel.send(&frame(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(ChannelError::NoConnectedPeers)));
    }

    #[tokio::test]
    async fn test_compressed_frame_reaches_peer() {
        let network = LoopbackNetwork::new();
        let (a, b) = pair(&network);
        let sender = DirectPeerChannel::new(a, Compression::On, DeliveryMode::Reliable);
        let receiver = DirectPeerChannel::new(b, Compression::Off, DeliveryMode::Unreliable);

        let original = frame();
        let report = sender.send(&original, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.recipients, 1);
        assert!(report.bytes_sent > 0);

        let inbound = receiver.poll_inbound(16);
        assert_eq!(inbound.len(), 1);
        match &inbound[0] {
            InboundMessage::Frame { from, frame } => {
                assert_eq!(from.as_str(), "a");
                assert_eq!(frame, &original);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_send_writes_nothing() {
        let network = LoopbackNetwork::new();
        let (a, b) = pair(&network);
        let channel = DirectPeerChannel::new(a, Compression::Off, DeliveryMode::Unreliable);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = channel.send(&frame(), &cancel).await;
        assert!(matches!(result, Err(ChannelError::Cancelled)));
        assert!(b.incoming().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_frame_is_dropped() {
        let network = LoopbackNetwork::new();
        let (a, b) = pair(&network);
        let channel = DirectPeerChannel::new(a, Compression::Off, DeliveryMode::Unreliable);

        let mut bad = frame();
        let body = *bad.bodies().next().unwrap().0;
        let mut records = bad.remove(&body).unwrap();
        records[0].translation.x = f64::NAN;
        bad.insert(body, records);

        let result = channel.send(&bad, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ChannelError::Encode(_))));
        assert!(b.incoming().is_empty());
    }

    #[tokio::test]
    async fn test_control_messages_are_decoded() {
        let network = LoopbackNetwork::new();
        let (a, b) = pair(&network);
        let sender = DirectPeerChannel::new(a, Compression::Off, DeliveryMode::Unreliable);
        let receiver = DirectPeerChannel::new(b, Compression::Off, DeliveryMode::Unreliable);

        sender
            .send_control(
                &ControlMessage::new(ControlMessage::FRAME_READY, true),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let inbound = receiver.poll_inbound(16);
        assert!(matches!(
            &inbound[..],
            [InboundMessage::Control { message, .. }] if message.key == "frameReady" && message.value
        ));
    }

    async fn udp_pair() -> (Arc<UdpPeerLink>, Arc<UdpPeerLink>) {
        let a = UdpPeerLink::bind("127.0.0.1:0".parse().unwrap(), "a").await.unwrap();
        let b = UdpPeerLink::bind("127.0.0.1:0".parse().unwrap(), "b").await.unwrap();
        b.start_advertising().unwrap();
        a.invite(b.local_addr()).await.unwrap();
        for _ in 0..200 {
            if !a.connected_peers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(a.connected_peers().len(), 1);
        (Arc::new(a), Arc::new(b))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_multi_body_frame_over_udp() {
        let config = PipelineConfig::default();
        let encoder = PoseEncoder::from_config(&config);
        let ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];

        let mut original = TrackedBodyFrame::new();
        for sample in SyntheticSource::samples_at(&ids, 2.5) {
            original.insert(sample.body_id, encoder.encode(&sample, &sample.anchor));
        }
        let encoded = WireCodec::new(config.compression).encode_frame(&original).unwrap();
        assert!(encoded.len() > MAX_DATAGRAM_SIZE);

        let (a, b) = udp_pair().await;
        let sender = DirectPeerChannel::new(a, config.compression, config.delivery);
        let receiver = DirectPeerChannel::new(b, config.compression, config.delivery);

        let report = sender.send(&original, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.recipients, 1);
        assert!(report.bytes_sent as usize > encoded.len());

        let mut inbound = Vec::new();
        for _ in 0..400 {
            inbound = receiver.poll_inbound(16);
            if !inbound.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        match &inbound[..] {
            [InboundMessage::Frame { frame, .. }] => {
                assert_eq!(frame.len(), 3);
                assert_eq!(frame, &original);
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_compressed_multi_body_frame_over_udp() {
        let encoder = PoseEncoder::default();
        let ids: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();

        let mut original = TrackedBodyFrame::new();
        for sample in SyntheticSource::samples_at(&ids, 0.75) {
            original.insert(sample.body_id, encoder.encode(&sample, &sample.anchor));
        }

        let (a, b) = udp_pair().await;
        let sender = DirectPeerChannel::new(a, Compression::On, DeliveryMode::Unreliable);
        let receiver = DirectPeerChannel::new(b, Compression::Off, DeliveryMode::Unreliable);

        sender.send(&original, &CancellationToken::new()).await.unwrap();

        let mut inbound = Vec::new();
        for _ in 0..400 {
            inbound = receiver.poll_inbound(16);
            if !inbound.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(
            &inbound[..],
            [InboundMessage::Frame { frame, .. }] if frame == &original
        ));
    }
}
