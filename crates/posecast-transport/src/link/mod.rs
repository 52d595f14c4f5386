//! Point-to-multipoint links between peers.

mod fragment;
mod loopback;
mod udp;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_channel::Receiver;
use posecast_ipc::DeliveryMode;

use crate::ChannelResult;

pub use loopback::{LoopbackLink, LoopbackNetwork};
pub use udp::UdpPeerLink;

/// Identity of a peer on a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A payload received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPacket {
    pub from: PeerId,
    pub payload: Bytes,
}

/// A session of directly connected peers.
///
/// Only currently connected peers are addressable; nothing is buffered for
/// peers that are not connected.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// This side's identity.
    fn local_peer(&self) -> &PeerId;

    /// Peers connected right now.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Send one payload to one peer, returning the bytes written.
    async fn send_to(&self, peer: &PeerId, payload: Bytes, mode: DeliveryMode) -> ChannelResult<usize>;

    /// Payloads received from connected peers.
    fn incoming(&self) -> Receiver<PeerPacket>;

    /// Accept connection requests from other peers.
    fn start_advertising(&self) -> ChannelResult<()>;

    fn stop_advertising(&self) -> ChannelResult<()>;

    fn is_advertising(&self) -> bool;
}
