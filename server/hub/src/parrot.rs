//! Echo loopback. Transmissions to the parrot id are recorded, then played
//! back to the source repeater at the DMR frame cadence after a short
//! think delay. Parrot traffic never enters the routing fabric.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use rx_bus::{keys, topics, MessageBus, SessionStore};
use rx_dmr::Packet;

use crate::calltracker::CallTracker;

const STREAM_TTL: Duration = Duration::from_secs(300);
const THINK_DELAY: Duration = Duration::from_secs(3);
const FRAME_CADENCE: Duration = Duration::from_millis(60);

pub struct Parrot {
    store: Arc<dyn SessionStore>,
    bus: Arc<dyn MessageBus>,
    tracker: Arc<CallTracker>,
    recordings: DashMap<u32, Vec<Packet>>,
}

impl Parrot {
    pub fn new(
        store: Arc<dyn SessionStore>,
        bus: Arc<dyn MessageBus>,
        tracker: Arc<CallTracker>,
    ) -> Self {
        Self { store, bus, tracker, recordings: DashMap::new() }
    }

    /// Record one packet of a parrot-destined stream; on the terminator,
    /// schedule the replay.
    pub async fn handle(self: &Arc<Self>, packet: Packet, radio_id: u32) {
        let key = keys::parrot_stream(packet.stream_id);
        match self.store.exists(&key).await {
            Ok(false) => {
                let marker = Bytes::copy_from_slice(&radio_id.to_be_bytes());
                if let Err(e) = self.store.set(&key, marker, STREAM_TTL).await {
                    warn!("parrot stream marker failed: {e}");
                }
            }
            Ok(true) => {}
            Err(e) => {
                warn!("parrot stream lookup failed: {e}");
                return;
            }
        }

        let stream_id = packet.stream_id;
        let ended = packet.is_voice_term();
        self.recordings.entry(stream_id).or_default().push(packet);

        if ended {
            let Some((_, frames)) = self.recordings.remove(&stream_id) else {
                return;
            };
            debug!(stream_id, radio_id, frames = frames.len(), "parrot replay scheduled");
            let parrot = self.clone();
            tokio::spawn(async move {
                parrot.replay(frames, radio_id).await;
            });
        }
    }

    /// Paced playback: one frame per 60 ms. When an iteration overshoots,
    /// the next sleep is shortened by the overshoot so long-term drift
    /// stays bounded.
    async fn replay(&self, frames: Vec<Packet>, radio_id: u32) {
        sleep(THINK_DELAY).await;

        let stream_id = frames.first().map(|f| f.stream_id).unwrap_or(0);
        let topic = topics::repeater_packets(radio_id);
        let mut overshoot = Duration::ZERO;

        for frame in &frames {
            let iteration = Instant::now();

            self.tracker.handle_packet(frame).await;
            let wire = Bytes::copy_from_slice(&frame.encode());
            if let Err(e) = self.bus.publish(&topic, wire).await {
                warn!(radio_id, "parrot replay publish failed: {e}");
            }

            sleep(FRAME_CADENCE.saturating_sub(overshoot)).await;
            overshoot = iteration.elapsed().saturating_sub(FRAME_CADENCE);
        }

        if let Err(e) = self.store.delete(&keys::parrot_stream(stream_id)).await {
            warn!("parrot stream cleanup failed: {e}");
        }
    }
}
