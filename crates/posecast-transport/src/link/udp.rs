//! Peer link over UDP datagrams.
//!
//! Every datagram starts with one envelope byte. `HELLO` and `WELCOME` carry
//! the sender's display name and form the connection handshake, `DATA`
//! carries a payload and `BYE` disconnects. A payload too large for one
//! datagram travels as a run of `FRAGMENT` datagrams and is delivered only
//! once complete. An advertising link accepts every `HELLO` it receives.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use posecast_ipc::DeliveryMode;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::fragment::{self, FragmentReceiver};
use super::{PeerId, PeerLink, PeerPacket};
use crate::error::ChannelError;
use crate::{ChannelResult, INBOUND_CHANNEL_CAPACITY, MAX_DATAGRAM_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Envelope {
    Hello = 1,
    Welcome = 2,
    Data = 3,
    Bye = 4,
    Fragment = 5,
}

impl Envelope {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Hello),
            2 => Some(Self::Welcome),
            3 => Some(Self::Data),
            4 => Some(Self::Bye),
            5 => Some(Self::Fragment),
            _ => None,
        }
    }

    fn wrap(self, body: &[u8]) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(body.len() + 1);
        datagram.push(self as u8);
        datagram.extend_from_slice(body);
        datagram
    }
}

#[derive(Default)]
struct LinkShared {
    peers: RwLock<HashMap<PeerId, SocketAddr>>,
    advertising: AtomicBool,
}

impl LinkShared {
    fn peer_at(&self, addr: SocketAddr) -> Option<PeerId> {
        self.peers
            .read()
            .iter()
            .find(|(_, peer_addr)| **peer_addr == addr)
            .map(|(peer, _)| peer.clone())
    }

    fn remove_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        let peer = self.peer_at(addr)?;
        self.peers.write().remove(&peer);
        Some(peer)
    }
}

/// A [`PeerLink`] over a bound UDP socket.
///
/// Unreliable delivery only.
pub struct UdpPeerLink {
    local: PeerId,
    display_name: String,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    shared: Arc<LinkShared>,
    inbox: Receiver<PeerPacket>,
    next_message: AtomicU32,
    cancel: CancellationToken,
}

impl UdpPeerLink {
    /// Bind and start the receive loop on the current runtime.
    #[instrument(name = "udp_bind", skip(display_name))]
    pub async fn bind(addr: SocketAddr, display_name: impl Into<String>) -> ChannelResult<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let display_name = display_name.into();
        let shared = Arc::new(LinkShared::default());
        let cancel = CancellationToken::new();
        let (inbox_tx, inbox) = crossbeam_channel::bounded(INBOUND_CHANNEL_CAPACITY);

        tokio::spawn(receive_loop(
            Arc::clone(&socket),
            Arc::clone(&shared),
            inbox_tx,
            display_name.clone(),
            cancel.clone(),
        ));

        info!(%local_addr, name = %display_name, "UDP peer link bound");
        Ok(Self {
            local: peer_id(display_name.as_bytes(), local_addr),
            display_name,
            socket,
            local_addr,
            shared,
            inbox,
            next_message: AtomicU32::new(0),
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the link at `addr` to connect. The peer appears in
    /// [`connected_peers`](PeerLink::connected_peers) once it answers.
    pub async fn invite(&self, addr: SocketAddr) -> ChannelResult<()> {
        let hello = Envelope::Hello.wrap(self.display_name.as_bytes());
        self.socket.send_to(&hello, addr).await?;
        debug!(%addr, "Invitation sent");
        Ok(())
    }

    /// Tell every connected peer we are leaving.
    pub async fn leave(&self) {
        let peers: Vec<SocketAddr> = self.shared.peers.write().drain().map(|(_, addr)| addr).collect();
        let bye = Envelope::Bye.wrap(&[]);
        for addr in peers {
            if let Err(e) = self.socket.send_to(&bye, addr).await {
                debug!(%addr, error = %e, "Failed to send goodbye");
            }
        }
    }
}

#[async_trait]
impl PeerLink for UdpPeerLink {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.shared.peers.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    async fn send_to(&self, peer: &PeerId, payload: Bytes, mode: DeliveryMode) -> ChannelResult<usize> {
        if mode == DeliveryMode::Reliable {
            return Err(ChannelError::UnsupportedDelivery(mode));
        }
        let addr = self
            .shared
            .peers
            .read()
            .get(peer)
            .copied()
            .ok_or_else(|| ChannelError::UnknownPeer(peer.to_string()))?;

        let datagrams = if payload.len() < MAX_DATAGRAM_SIZE {
            vec![Envelope::Data.wrap(&payload)]
        } else {
            let message = self.next_message.fetch_add(1, Ordering::Relaxed);
            let fragments = fragment::split(message, &payload)?;
            trace!(%peer, message, fragments = fragments.len(), "Fragmenting payload");
            fragments
                .iter()
                .map(|body| Envelope::Fragment.wrap(body))
                .collect()
        };

        let mut written = 0;
        for datagram in &datagrams {
            written += self
                .socket
                .send_to(datagram, addr)
                .await
                .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        }
        Ok(written)
    }

    fn incoming(&self) -> Receiver<PeerPacket> {
        self.inbox.clone()
    }

    fn start_advertising(&self) -> ChannelResult<()> {
        self.shared.advertising.store(true, Ordering::SeqCst);
        info!(addr = %self.local_addr, "Advertising");
        Ok(())
    }

    fn stop_advertising(&self) -> ChannelResult<()> {
        self.shared.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.shared.advertising.load(Ordering::SeqCst)
    }
}

impl Drop for UdpPeerLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn peer_id(name: &[u8], addr: SocketAddr) -> PeerId {
    PeerId::new(format!("{}@{}", String::from_utf8_lossy(name), addr))
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<LinkShared>,
    inbox: Sender<PeerPacket>,
    display_name: String,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut fragments = FragmentReceiver::default();
    loop {
        let (len, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!("UDP receive error: {}", e);
                    continue;
                }
            },
        };

        let Some((&kind, body)) = buf[..len].split_first() else {
            continue;
        };

        match Envelope::from_byte(kind) {
            Some(Envelope::Hello) => {
                if !shared.advertising.load(Ordering::SeqCst) {
                    debug!(%addr, "Ignoring invitation while not advertising");
                    continue;
                }
                let peer = peer_id(body, addr);
                shared.peers.write().insert(peer.clone(), addr);
                let welcome = Envelope::Welcome.wrap(display_name.as_bytes());
                if let Err(e) = socket.send_to(&welcome, addr).await {
                    warn!(%addr, error = %e, "Failed to answer invitation");
                }
                info!(%peer, "Peer connected");
            }
            Some(Envelope::Welcome) => {
                let peer = peer_id(body, addr);
                shared.peers.write().insert(peer.clone(), addr);
                info!(%peer, "Peer connected");
            }
            Some(Envelope::Data) => {
                let Some(from) = shared.peer_at(addr) else {
                    trace!(%addr, "Dropping datagram from unconnected address");
                    continue;
                };
                if !deliver(&inbox, from, Bytes::copy_from_slice(body)) {
                    break;
                }
            }
            Some(Envelope::Fragment) => {
                let Some(from) = shared.peer_at(addr) else {
                    trace!(%addr, "Dropping fragment from unconnected address");
                    continue;
                };
                if let Some(payload) = fragments.receive(addr, body) {
                    if !deliver(&inbox, from, payload) {
                        break;
                    }
                }
            }
            Some(Envelope::Bye) => {
                fragments.forget(addr);
                if let Some(peer) = shared.remove_addr(addr) {
                    info!(%peer, "Peer disconnected");
                }
            }
            None => trace!(kind, "Unknown envelope"),
        }
    }

    debug!("UDP receive loop exiting");
}

// False once the inbox is gone.
fn deliver(inbox: &Sender<PeerPacket>, from: PeerId, payload: Bytes) -> bool {
    match inbox.try_send(PeerPacket { from, payload }) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            trace!("Inbox full, payload dropped");
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    async fn bound(name: &str) -> UdpPeerLink {
        UdpPeerLink::bind("127.0.0.1:0".parse().unwrap(), name).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handshake_and_data() {
        let a = bound("a").await;
        let b = bound("b").await;
        b.start_advertising().unwrap();

        a.invite(b.local_addr()).await.unwrap();
        assert!(wait_for(|| !a.connected_peers().is_empty()).await);
        assert!(wait_for(|| !b.connected_peers().is_empty()).await);

        let peer = a.connected_peers()[0].clone();
        assert!(peer.as_str().starts_with("b@"));
        a.send_to(&peer, Bytes::from_static(b"{}"), DeliveryMode::Unreliable)
            .await
            .unwrap();

        let inbox = b.incoming();
        assert!(wait_for(|| !inbox.is_empty()).await);
        let packet = inbox.try_recv().unwrap();
        assert_eq!(&packet.payload[..], b"{}");
        assert_eq!(packet.from.as_str(), format!("a@{}", a.local_addr()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_payload_is_fragmented() {
        let a = bound("a").await;
        let b = bound("b").await;
        b.start_advertising().unwrap();
        a.invite(b.local_addr()).await.unwrap();
        assert!(wait_for(|| !a.connected_peers().is_empty()).await);

        let payload: Vec<u8> = (0..MAX_DATAGRAM_SIZE * 2).map(|i| (i % 253) as u8).collect();
        let peer = a.connected_peers()[0].clone();
        let written = a
            .send_to(&peer, Bytes::from(payload.clone()), DeliveryMode::Unreliable)
            .await
            .unwrap();
        assert!(written > payload.len());

        let inbox = b.incoming();
        assert!(wait_for(|| !inbox.is_empty()).await);
        let packet = inbox.try_recv().unwrap();
        assert_eq!(packet.payload.len(), payload.len());
        assert_eq!(&packet.payload[..], &payload[..]);
        assert!(inbox.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invitation_ignored_unless_advertising() {
        let a = bound("a").await;
        let b = bound("b").await;

        a.invite(b.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.connected_peers().is_empty());
        assert!(b.connected_peers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bye_disconnects() {
        let a = bound("a").await;
        let b = bound("b").await;
        b.start_advertising().unwrap();
        a.invite(b.local_addr()).await.unwrap();
        assert!(wait_for(|| !b.connected_peers().is_empty()).await);

        a.leave().await;
        assert!(a.connected_peers().is_empty());
        assert!(wait_for(|| b.connected_peers().is_empty()).await);
    }

    #[tokio::test]
    async fn test_reliable_and_unknown_peer_rejected() {
        let a = bound("a").await;
        let peer = PeerId::new("nobody");

        let result = a.send_to(&peer, Bytes::new(), DeliveryMode::Reliable).await;
        assert!(matches!(result, Err(ChannelError::UnsupportedDelivery(DeliveryMode::Reliable))));

        let result = a.send_to(&peer, Bytes::new(), DeliveryMode::Unreliable).await;
        assert!(matches!(result, Err(ChannelError::UnknownPeer(_))));
    }

    #[test]
    fn test_envelope_bytes() {
        assert_eq!(Envelope::Data.wrap(b"ab"), vec![3, b'a', b'b']);
        assert_eq!(Envelope::from_byte(1), Some(Envelope::Hello));
        assert_eq!(Envelope::from_byte(5), Some(Envelope::Fragment));
        assert_eq!(Envelope::from_byte(9), None);
    }
}
