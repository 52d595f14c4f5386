//! The distribution channel interface.

use async_trait::async_trait;
use posecast_encoder::{JointRecord, TrackedBodyFrame};
use posecast_ipc::ControlMessage;
use tokio_util::sync::CancellationToken;

use crate::link::PeerId;
use crate::ChannelResult;

/// Outcome of one successful send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Bytes written to the network, summed over recipients.
    pub bytes_sent: u64,

    /// Messages written.
    pub messages: u64,

    /// Peers or participants addressed.
    pub recipients: usize,
}

impl SendReport {
    /// A send that had nobody to deliver to.
    pub fn skipped() -> Self {
        Self::default()
    }

    pub fn is_skipped(&self) -> bool {
        self.messages == 0
    }
}

/// A decoded message received from another device.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A whole frame from the direct channel.
    Frame { from: PeerId, frame: TrackedBodyFrame },

    /// A single record from a group messenger.
    Record { from: PeerId, record: JointRecord },

    /// An out-of-band control signal.
    Control { from: PeerId, message: ControlMessage },
}

/// Something the pacer can hand a frame to.
///
/// Implementations check `cancel` on entry and before every network write,
/// never in the middle of one.
#[async_trait]
pub trait DistributionChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(
        &self,
        frame: &TrackedBodyFrame,
        cancel: &CancellationToken,
    ) -> ChannelResult<SendReport>;

    /// Drain up to `max` messages received since the last call.
    fn poll_inbound(&self, _max: usize) -> Vec<InboundMessage> {
        Vec::new()
    }
}
