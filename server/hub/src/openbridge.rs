//! OpenBridge peer exchange: stateless, HMAC-authenticated, TS1 only.
//!
//! Every datagram stands alone. Unknown peers, bad tags, and TS2 traffic
//! are dropped without a reply; OpenBridge has no NAK.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use rx_bus::{topics, MessageBus};
use rx_control::{HubRepo, Peer, PeerId};
use rx_dmr::{openbridge, Packet};
use rx_metrics::HubMetrics;

use crate::envelope;

pub struct OpenBridgeServer {
    repo: Arc<dyn HubRepo>,
    bus: Arc<dyn MessageBus>,
    metrics: HubMetrics,
}

impl OpenBridgeServer {
    pub fn new(repo: Arc<dyn HubRepo>, bus: Arc<dyn MessageBus>, metrics: HubMetrics) -> Self {
        Self { repo, bus, metrics }
    }

    /// Drains `openbridge:incoming`.
    pub async fn run_ingress(self: Arc<Self>) {
        let mut sub = match self.bus.subscribe(topics::OPENBRIDGE_INCOMING).await {
            Ok(s) => s,
            Err(e) => {
                warn!("openbridge ingress subscribe failed: {e}");
                return;
            }
        };
        while let Some(payload) = sub.recv().await {
            let Some((addr, datagram)) = envelope::open(&payload) else {
                continue;
            };
            self.handle_frame(addr, &datagram).await;
        }
    }

    pub async fn handle_frame(&self, addr: SocketAddr, datagram: &[u8]) {
        if datagram.len() != openbridge::FRAME_LEN_OPENBRIDGE
            || &datagram[0..4] != rx_dmr::packet::SIGNATURE
        {
            self.metrics.ob_drop("invalid_frame");
            return;
        }

        let Some(peer_id) = openbridge::peer_id(datagram) else {
            self.metrics.ob_drop("invalid_frame");
            return;
        };
        let peer = match self.repo.get_peer(PeerId(peer_id)).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                debug!(peer_id, "datagram from unknown peer");
                self.metrics.ob_drop("unknown_peer");
                return;
            }
            Err(e) => {
                warn!("peer lookup failed: {e}");
                return;
            }
        };

        let packet = match openbridge::open(datagram, peer.password.as_bytes()) {
            Ok(p) => p,
            Err(rx_dmr::FrameError::BadTag) => {
                debug!(peer_id, %addr, "bad authentication tag");
                self.metrics.ob_drop("bad_tag");
                return;
            }
            Err(e) => {
                debug!(peer_id, "undecodable openbridge payload: {e}");
                self.metrics.ob_drop("invalid_frame");
                return;
            }
        };

        if packet.slot {
            self.metrics.ob_drop("ts2");
            return;
        }

        if !peer.should_ingress(packet.dst) {
            debug!(peer_id, dst = packet.dst, "ingress rules rejected packet");
            self.metrics.ob_drop("ingress_rule");
            return;
        }

        // Peer-to-peer leg.
        self.forward_to_peers(&packet, Some(peer.id)).await;

        // Cross-protocol leg: local repeaters pick this up from the
        // talkgroup fan-out like any other group packet.
        let wire = Bytes::copy_from_slice(&packet.encode());
        if let Err(e) = self.bus.publish(&topics::talkgroup_packets(packet.dst), wire).await {
            warn!("cross-protocol publish failed: {e}");
        }
    }

    /// Drains `openbridge:packets`: group traffic from the HBRP side that
    /// should egress to peers.
    pub async fn run_local_egress(self: Arc<Self>) {
        let mut sub = match self.bus.subscribe(topics::OPENBRIDGE_PACKETS).await {
            Ok(s) => s,
            Err(e) => {
                warn!("openbridge egress subscribe failed: {e}");
                return;
            }
        };
        while let Some(frame) = sub.recv().await {
            let Ok(packet) = Packet::decode(&frame) else {
                continue;
            };
            if packet.slot {
                // TS2 never crosses an OpenBridge link.
                self.metrics.ob_drop("ts2");
                continue;
            }
            self.forward_to_peers(&packet, None).await;
        }
    }

    /// Sends the packet to every egress-matching peer except `skip`,
    /// re-sealed under that peer's own key.
    async fn forward_to_peers(&self, packet: &Packet, skip: Option<PeerId>) {
        let peers = match self.repo.list_peers().await {
            Ok(p) => p,
            Err(e) => {
                warn!("peer list failed: {e}");
                return;
            }
        };

        let mut fanout = 0usize;
        for peer in &peers {
            if Some(peer.id) == skip || !peer.should_egress(packet.src) {
                continue;
            }
            let Some(addr) = peer_addr(peer) else {
                debug!(peer_id = peer.id.0, "egress peer without address");
                continue;
            };
            let sealed = openbridge::seal(packet, peer.password.as_bytes());
            if let Err(e) = self
                .bus
                .publish(topics::OPENBRIDGE_OUTGOING, envelope::seal(addr, &sealed))
                .await
            {
                warn!(peer_id = peer.id.0, "egress publish failed: {e}");
                continue;
            }
            fanout += 1;
        }
        if fanout > 0 {
            self.metrics.ob_tx(fanout);
        }
    }
}

fn peer_addr(peer: &Peer) -> Option<SocketAddr> {
    let ip = peer.ip.as_deref()?;
    let port = peer.port?;
    format!("{ip}:{port}").parse().ok()
}
