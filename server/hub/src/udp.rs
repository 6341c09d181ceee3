//! UDP plumbing: one reader and one writer task per protocol socket.
//!
//! The reader owns a scratch buffer that is reused by the next `recv_from`;
//! the datagram MUST be copied out before the per-packet task is spawned.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use rx_bus::{topics, MessageBus};
use rx_metrics::HubMetrics;

use crate::envelope;
use crate::session::Sessions;

/// Which wire protocol a socket task serves; only affects accounting.
#[derive(Clone, Copy)]
pub enum Proto {
    Hbrp,
    OpenBridge,
}

impl Proto {
    fn rx(self, metrics: &HubMetrics, n: usize) {
        match self {
            Proto::Hbrp => metrics.hbrp_rx(n),
            Proto::OpenBridge => metrics.ob_rx(n),
        }
    }

    fn tx(self, metrics: &HubMetrics, n: usize) {
        match self {
            Proto::Hbrp => metrics.hbrp_tx(n),
            Proto::OpenBridge => metrics.ob_tx(1),
        }
    }
}

pub async fn run_reader(
    socket: Arc<UdpSocket>,
    bus: Arc<dyn MessageBus>,
    topic: &'static str,
    proto: Proto,
    metrics: HubMetrics,
) -> Result<()> {
    let mut scratch = [0u8; 2048];
    loop {
        let (n, addr) = socket.recv_from(&mut scratch).await?;
        proto.rx(&metrics, n);

        // Copy before spawning; the scratch buffer is reused immediately.
        let datagram = Bytes::copy_from_slice(&scratch[..n]);
        let bus = bus.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.publish(topic, envelope::seal(addr, &datagram)).await {
                warn!(topic, "ingress publish failed: {e}");
            }
        });
    }
}

pub async fn run_sender(
    socket: Arc<UdpSocket>,
    bus: Arc<dyn MessageBus>,
    topic: &'static str,
    proto: Proto,
    metrics: HubMetrics,
) -> Result<()> {
    let mut sub = bus.subscribe(topic).await?;
    while let Some(payload) = sub.recv().await {
        let Some((addr, datagram)) = envelope::open(&payload) else {
            debug!(topic, "malformed outgoing envelope");
            continue;
        };
        match socket.send_to(&datagram, addr).await {
            Ok(n) => proto.tx(&metrics, n),
            Err(e) => debug!(%addr, "udp send failed: {e}"),
        }
    }
    Ok(())
}

/// Drains `hbrp:outgoing:noaddr`: frames addressed by repeater id only.
/// The session store supplies the socket address.
pub async fn run_noaddr_resolver(bus: Arc<dyn MessageBus>, sessions: Sessions) -> Result<()> {
    let mut sub = bus.subscribe(topics::HBRP_OUTGOING_NOADDR).await?;
    while let Some(frame) = sub.recv().await {
        let Some(radio_id) = repeater_id_of(&frame) else {
            debug!("noaddr frame too short");
            continue;
        };
        let Some(session) = sessions.load(radio_id).await else {
            debug!(radio_id, "noaddr frame for unregistered repeater");
            continue;
        };
        if let Err(e) = bus
            .publish(topics::HBRP_OUTGOING, envelope::seal(session.addr, &frame))
            .await
        {
            warn!(radio_id, "outgoing publish failed: {e}");
        }
    }
    Ok(())
}

fn repeater_id_of(frame: &[u8]) -> Option<u32> {
    if frame.len() < 15 {
        return None;
    }
    Some(u32::from_be_bytes([frame[11], frame[12], frame[13], frame[14]]))
}
