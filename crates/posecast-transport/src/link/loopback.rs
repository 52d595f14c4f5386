//! In-process peer mesh.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use posecast_ipc::DeliveryMode;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{PeerId, PeerLink, PeerPacket};
use crate::error::ChannelError;
use crate::{ChannelResult, INBOUND_CHANNEL_CAPACITY, RELIABLE_SEND_TIMEOUT_MS};

struct Endpoint {
    inbox: Sender<PeerPacket>,
    advertising: bool,
    connected: BTreeSet<PeerId>,
}

/// A set of peers that can connect to each other inside one process.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<HashMap<PeerId, Endpoint>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer on the network.
    pub fn join(&self, name: impl Into<String>) -> LoopbackLink {
        self.join_with_capacity(name, INBOUND_CHANNEL_CAPACITY)
    }

    /// Register a peer whose inbox holds at most `capacity` packets.
    pub fn join_with_capacity(&self, name: impl Into<String>, capacity: usize) -> LoopbackLink {
        let peer = PeerId::new(name);
        let (inbox, receiver) = crossbeam_channel::bounded(capacity.max(1));
        self.endpoints.lock().insert(
            peer.clone(),
            Endpoint {
                inbox,
                advertising: false,
                connected: BTreeSet::new(),
            },
        );
        debug!(%peer, "Peer joined loopback network");

        LoopbackLink {
            peer,
            network: self.clone(),
            inbox: receiver,
        }
    }

    /// Invite `to`; succeeds only while `to` is advertising.
    pub fn connect(&self, from: &PeerId, to: &PeerId) -> ChannelResult<()> {
        let mut endpoints = self.endpoints.lock();
        if !endpoints.contains_key(from) {
            return Err(ChannelError::UnknownPeer(from.to_string()));
        }
        let target = endpoints
            .get_mut(to)
            .ok_or_else(|| ChannelError::UnknownPeer(to.to_string()))?;
        if !target.advertising {
            return Err(ChannelError::NotAdvertising);
        }
        target.connected.insert(from.clone());
        if let Some(source) = endpoints.get_mut(from) {
            source.connected.insert(to.clone());
        }
        debug!(%from, %to, "Peers connected");
        Ok(())
    }

    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let mut endpoints = self.endpoints.lock();
        if let Some(endpoint) = endpoints.get_mut(a) {
            endpoint.connected.remove(b);
        }
        if let Some(endpoint) = endpoints.get_mut(b) {
            endpoint.connected.remove(a);
        }
    }

    fn leave(&self, peer: &PeerId) {
        let mut endpoints = self.endpoints.lock();
        endpoints.remove(peer);
        for endpoint in endpoints.values_mut() {
            endpoint.connected.remove(peer);
        }
    }

    fn inbox_of(&self, from: &PeerId, to: &PeerId) -> ChannelResult<Sender<PeerPacket>> {
        let endpoints = self.endpoints.lock();
        let connected = endpoints
            .get(from)
            .is_some_and(|endpoint| endpoint.connected.contains(to));
        if !connected {
            return Err(ChannelError::UnknownPeer(to.to_string()));
        }
        endpoints
            .get(to)
            .map(|endpoint| endpoint.inbox.clone())
            .ok_or_else(|| ChannelError::UnknownPeer(to.to_string()))
    }

    fn set_advertising(&self, peer: &PeerId, advertising: bool) -> ChannelResult<()> {
        let mut endpoints = self.endpoints.lock();
        let endpoint = endpoints
            .get_mut(peer)
            .ok_or_else(|| ChannelError::UnknownPeer(peer.to_string()))?;
        endpoint.advertising = advertising;
        Ok(())
    }
}

/// One peer's view of a [`LoopbackNetwork`].
pub struct LoopbackLink {
    peer: PeerId,
    network: LoopbackNetwork,
    inbox: Receiver<PeerPacket>,
}

impl LoopbackLink {
    /// Connect to `other`, which must be advertising.
    pub fn connect(&self, other: &PeerId) -> ChannelResult<()> {
        self.network.connect(&self.peer, other)
    }

    pub fn disconnect(&self, other: &PeerId) {
        self.network.disconnect(&self.peer, other);
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    fn local_peer(&self) -> &PeerId {
        &self.peer
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.network
            .endpoints
            .lock()
            .get(&self.peer)
            .map(|endpoint| endpoint.connected.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn send_to(&self, peer: &PeerId, payload: Bytes, mode: DeliveryMode) -> ChannelResult<usize> {
        let inbox = self.network.inbox_of(&self.peer, peer)?;
        let size = payload.len();
        let mut packet = PeerPacket {
            from: self.peer.clone(),
            payload,
        };

        let deadline = Instant::now() + Duration::from_millis(RELIABLE_SEND_TIMEOUT_MS);
        loop {
            match inbox.try_send(packet) {
                Ok(()) => {
                    trace!(%peer, bytes = size, "Packet delivered");
                    return Ok(size);
                }
                Err(TrySendError::Full(returned)) => match mode {
                    DeliveryMode::Unreliable => {
                        trace!(%peer, "Peer inbox full, packet dropped");
                        return Ok(size);
                    }
                    DeliveryMode::Reliable if Instant::now() >= deadline => {
                        return Err(ChannelError::SendFailed(format!("{peer} inbox full")));
                    }
                    DeliveryMode::Reliable => {
                        packet = returned;
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                },
                Err(TrySendError::Disconnected(_)) => return Err(ChannelError::ChannelDisconnected),
            }
        }
    }

    fn incoming(&self) -> Receiver<PeerPacket> {
        self.inbox.clone()
    }

    fn start_advertising(&self) -> ChannelResult<()> {
        self.network.set_advertising(&self.peer, true)
    }

    fn stop_advertising(&self) -> ChannelResult<()> {
        self.network.set_advertising(&self.peer, false)
    }

    fn is_advertising(&self) -> bool {
        self.network
            .endpoints
            .lock()
            .get(&self.peer)
            .is_some_and(|endpoint| endpoint.advertising)
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.network.leave(&self.peer);
    }
}
