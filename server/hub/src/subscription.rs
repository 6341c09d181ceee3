//! Per-repeater bus listeners. Every registered repeater holds one worker
//! for its private-call topic and one per subscribed talkgroup; workers
//! rewrite the frame for their repeater and hand it to the address
//! resolver.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rx_bus::{topics, MessageBus};
use rx_metrics::HubMetrics;

use crate::session::Sessions;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum SubscriptionKey {
    Repeater,
    Talkgroup(u32),
}

struct Worker {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Worker {
    fn cancel(&self) {
        let _ = self.stop.send(true);
        self.task.abort();
    }
}

pub struct SubscriptionManager {
    bus: Arc<dyn MessageBus>,
    sessions: Sessions,
    metrics: HubMetrics,
    workers: DashMap<u32, Arc<DashMap<SubscriptionKey, Worker>>>,
}

impl SubscriptionManager {
    pub fn new(bus: Arc<dyn MessageBus>, sessions: Sessions, metrics: HubMetrics) -> Self {
        Self { bus, sessions, metrics, workers: DashMap::new() }
    }

    /// Bring the worker set in line with a session: the repeater topic plus
    /// every static and dynamic talkgroup.
    pub async fn sync_for_session(self: &Arc<Self>, radio_id: u32) {
        let Some(session) = self.sessions.load(radio_id).await else {
            return;
        };
        self.listen_for_repeater(radio_id);
        for tg in session.subscribed_talkgroups() {
            self.listen_for_talkgroup(radio_id, tg);
        }
    }

    /// Idempotent: many parallel calls leave exactly one worker.
    pub fn listen_for_repeater(self: &Arc<Self>, radio_id: u32) {
        self.spawn_if_absent(radio_id, SubscriptionKey::Repeater);
    }

    pub fn listen_for_talkgroup(self: &Arc<Self>, radio_id: u32, talkgroup: u32) {
        self.spawn_if_absent(radio_id, SubscriptionKey::Talkgroup(talkgroup));
    }

    fn spawn_if_absent(self: &Arc<Self>, radio_id: u32, key: SubscriptionKey) {
        let table = self.workers.entry(radio_id).or_default().clone();
        // The entry lock below resolves racing subscribe+cancel on one key.
        table.entry(key).or_insert_with(|| {
            let (stop, stopped) = watch::channel(false);
            let manager = self.clone();
            let task = tokio::spawn(async move {
                manager.run_worker(radio_id, key, stopped).await;
                manager.remove_worker(radio_id, key);
            });
            Worker { stop, task }
        });
        self.publish_gauge();
    }

    /// Refuses while the talkgroup is still a static member or the current
    /// dynamic talkgroup on either slot. Returns true when cancelled.
    pub async fn cancel_subscription(&self, radio_id: u32, talkgroup: u32) -> bool {
        if let Some(session) = self.sessions.load(radio_id).await {
            if session.holds_talkgroup(talkgroup) {
                debug!(radio_id, talkgroup, "refusing to cancel live subscription");
                return false;
            }
        }

        let Some(table) = self.workers.get(&radio_id).map(|t| t.clone()) else {
            return false;
        };
        let removed = table.remove(&SubscriptionKey::Talkgroup(talkgroup));
        match removed {
            Some((_, worker)) => {
                worker.cancel();
                self.publish_gauge();
                true
            }
            None => false,
        }
    }

    /// Tears down every worker of a repeater, typically on disconnect.
    pub fn cancel_all(&self, radio_id: u32) {
        if let Some((_, table)) = self.workers.remove(&radio_id) {
            for entry in table.iter() {
                entry.value().cancel();
            }
        }
        self.publish_gauge();
    }

    pub fn worker_count(&self, radio_id: u32) -> usize {
        self.workers.get(&radio_id).map(|t| t.len()).unwrap_or(0)
    }

    fn remove_worker(&self, radio_id: u32, key: SubscriptionKey) {
        if let Some(table) = self.workers.get(&radio_id).map(|t| t.clone()) {
            table.remove(&key);
        }
        self.publish_gauge();
    }

    fn publish_gauge(&self) {
        let total: usize = self.workers.iter().map(|t| t.len()).sum();
        self.metrics.subscription_workers(total);
    }

    async fn run_worker(
        self: &Arc<Self>,
        radio_id: u32,
        key: SubscriptionKey,
        mut stopped: watch::Receiver<bool>,
    ) {
        let topic = match key {
            SubscriptionKey::Repeater => topics::repeater_packets(radio_id),
            SubscriptionKey::Talkgroup(tg) => topics::talkgroup_packets(tg),
        };
        let mut sub = match self.bus.subscribe(&topic).await {
            Ok(s) => s,
            Err(e) => {
                warn!(radio_id, topic, "subscribe failed: {e}");
                return;
            }
        };

        loop {
            let frame = tokio::select! {
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        return;
                    }
                    continue;
                }
                frame = sub.recv() => match frame {
                    Some(f) => f,
                    None => return,
                },
            };

            match key {
                SubscriptionKey::Repeater => self.forward_to_repeater(radio_id, &frame).await,
                SubscriptionKey::Talkgroup(tg) => {
                    if !self.forward_talkgroup(radio_id, tg, &frame).await {
                        // Unlinked while we were still subscribed.
                        return;
                    }
                }
            }
        }
    }

    /// Private-call topic: the frame is already addressed to us, only the
    /// repeater id needs rewriting.
    async fn forward_to_repeater(&self, radio_id: u32, frame: &[u8]) {
        let Ok(mut packet) = rx_dmr::Packet::decode(frame) else {
            debug!(radio_id, "undecodable frame on repeater topic");
            return;
        };
        packet.repeater_id = radio_id;
        let _ = self
            .bus
            .publish(topics::HBRP_OUTGOING_NOADDR, Bytes::copy_from_slice(&packet.encode()))
            .await;
    }

    /// Talkgroup topic: skip loopback, then re-check that the repeater
    /// still wants this talkgroup and on which slot. Returns false when
    /// the subscription should end.
    async fn forward_talkgroup(&self, radio_id: u32, talkgroup: u32, frame: &[u8]) -> bool {
        let Ok(mut packet) = rx_dmr::Packet::decode(frame) else {
            debug!(radio_id, "undecodable frame on talkgroup topic");
            return true;
        };
        if packet.repeater_id == radio_id {
            return true; // our own transmission
        }

        let Some(session) = self.sessions.load(radio_id).await else {
            return false; // session gone, stop listening
        };
        let Some(slot) = session.wants_talkgroup(talkgroup) else {
            return false;
        };

        packet.repeater_id = radio_id;
        packet.slot = slot;
        let _ = self
            .bus
            .publish(topics::HBRP_OUTGOING_NOADDR, Bytes::copy_from_slice(&packet.encode()))
            .await;
        true
    }
}
