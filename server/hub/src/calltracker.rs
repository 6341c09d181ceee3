//! Per-stream call aggregation: loss, jitter, and BER for every voice
//! transmission, with an inactivity timer that closes abandoned streams.
//!
//! A call is identified by a 64-bit fingerprint over (stream id, src, dst,
//! slot, call type, active=true). The active flag is part of the identity
//! on purpose: a finished call can never collide with a new transmission
//! reusing the same stream id.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rx_bus::{topics, MessageBus};
use rx_control::{
    CallId, CallRecord, HubRepo, RadioId, TalkgroupId, UserId,
    model::CallTarget,
};
use rx_dmr::packet::{FrameType, Packet, DTYPE_VOICE_HEAD, DTYPE_VOICE_TERM, VSEQ_F};
use rx_metrics::HubMetrics;

/// Silence long enough to cover ~30 lost frames ends the call.
pub const CALL_END_TIMEOUT: Duration = Duration::from_secs(2);

/// Transmissions shorter than this are key-bounces and are erased.
pub const KEY_BOUNCE: Duration = Duration::from_millis(100);

/// Payload bits per voice burst, for BER accounting.
const VOICE_FRAME_BITS: u32 = 141;

/// DMR voice cadence in milliseconds.
const CADENCE_MS: f32 = 60.0;

struct TrackedCall {
    record: CallRecord,
    call_data: Vec<[u8; 33]>,
    started: tokio::time::Instant,
}

pub struct CallTracker {
    repo: Arc<dyn HubRepo>,
    bus: Arc<dyn MessageBus>,
    metrics: HubMetrics,
    active: DashMap<u64, TrackedCall>,
    timers: DashMap<u64, JoinHandle<()>>,
}

/// FNV-1a over the little-endian field concatenation. Stable across
/// processes, cheap, and collision-safe at call volumes.
pub fn fingerprint(p: &Packet) -> u64 {
    const OFF: u64 = 0xCBF2_9CE4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01B3;

    let mut bytes = [0u8; 15];
    bytes[0..4].copy_from_slice(&p.stream_id.to_le_bytes());
    bytes[4..8].copy_from_slice(&p.src.to_le_bytes());
    bytes[8..12].copy_from_slice(&p.dst.to_le_bytes());
    bytes[12] = p.slot as u8;
    bytes[13] = p.group_call as u8;
    bytes[14] = 1; // active

    let mut h = OFF;
    for &b in &bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

impl CallTracker {
    pub fn new(repo: Arc<dyn HubRepo>, bus: Arc<dyn MessageBus>, metrics: HubMetrics) -> Arc<Self> {
        Arc::new(Self {
            repo,
            bus,
            metrics,
            active: DashMap::new(),
            timers: DashMap::new(),
        })
    }

    pub fn active_calls(&self) -> usize {
        self.active.len()
    }

    /// Single entry point for the servers: starts, updates, and ends the
    /// call as the packet dictates.
    pub async fn handle_packet(self: &Arc<Self>, p: &Packet) {
        let fp = fingerprint(p);

        if !self.active.contains_key(&fp) && !self.start_call(p, fp).await {
            return;
        }

        self.process_packet(p, fp).await;

        if p.is_voice_term() {
            self.end_call(fp).await;
        }
    }

    /// Resolves the endpoints and creates the call. Unknown src/dst ids
    /// are an expected condition; the packet is simply not tracked.
    async fn start_call(self: &Arc<Self>, p: &Packet, fp: u64) -> bool {
        let src_known = match self.repo.user_exists(UserId(p.src)).await {
            Ok(v) => v,
            Err(e) => {
                warn!("user lookup failed: {e}");
                return false;
            }
        };
        if !src_known {
            debug!(src = p.src, "call from unknown user");
            return false;
        }

        let repeater_known = self.repo.repeater_exists(RadioId(p.repeater_id)).await.unwrap_or(false);
        if !repeater_known {
            debug!(repeater = p.repeater_id, "call from unknown repeater");
            return false;
        }

        let target = match self.resolve_target(p).await {
            Some(t) => t,
            None => {
                debug!(dst = p.dst, "call to unresolvable destination");
                return false;
            }
        };

        let now = Utc::now();
        let record = CallRecord {
            id: CallId::new(),
            stream_id: p.stream_id,
            user_id: UserId(p.src),
            repeater_id: RadioId(p.repeater_id),
            target,
            start_time: now,
            last_packet_time: now,
            duration_ms: 0,
            active: true,
            time_slot: p.slot,
            group_call: p.group_call,
            last_seq: None,
            last_frame_num: 0,
            total_packets: 0,
            lost_sequences: 0,
            loss: 0.0,
            jitter: 0.0,
            total_bits: 0,
            total_errors: 0,
            ber: 0.0,
            rssi: 0.0,
            has_header: false,
            has_term: false,
        };

        // At most one active call per fingerprint; a racing packet of the
        // same stream loses here and falls through to process_packet.
        let created = match self.active.entry(fp) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(TrackedCall {
                    record: record.clone(),
                    call_data: Vec::new(),
                    started: tokio::time::Instant::now(),
                });
                true
            }
        };
        if !created {
            return true;
        }

        if let Err(e) = self.repo.create_call(&record).await {
            warn!("call insert failed: {e}");
        }
        self.arm_timer(fp);
        self.metrics.call_started();
        true
    }

    async fn resolve_target(&self, p: &Packet) -> Option<CallTarget> {
        if p.group_call {
            if self.repo.talkgroup_exists(TalkgroupId(p.dst)).await.unwrap_or(false) {
                return Some(CallTarget::Talkgroup(TalkgroupId(p.dst)));
            }
            if self.repo.repeater_exists(RadioId(p.dst)).await.unwrap_or(false) {
                return Some(CallTarget::Repeater(RadioId(p.dst)));
            }
            return None;
        }
        if self.repo.user_exists(UserId(p.dst)).await.unwrap_or(false) {
            return Some(CallTarget::User(UserId(p.dst)));
        }
        None
    }

    async fn process_packet(self: &Arc<Self>, p: &Packet, fp: u64) {
        if !self.active.contains_key(&fp) {
            return;
        }

        // The timer resets before the duplicate check, so a flood of
        // duplicated bursts keeps the call alive.
        self.arm_timer(fp);

        let now = Utc::now();
        let updated = {
            let mut entry = match self.active.get_mut(&fp) {
                Some(e) => e,
                None => return,
            };
            let tracked = entry.value_mut();
            let call = &mut tracked.record;

            if call.last_seq == Some(p.seq) {
                return; // duplicate burst
            }

            let elapsed_ms = (now - call.last_packet_time).num_milliseconds() as f32;
            call.jitter = (call.jitter + (elapsed_ms - CADENCE_MS)) / 2.0;
            call.last_packet_time = now;
            call.duration_ms = (now - call.start_time).num_milliseconds();
            call.last_seq = Some(p.seq);

            apply_sequence(call, p);

            call.total_bits += VOICE_FRAME_BITS;
            if p.ber > 0 {
                call.total_errors += p.ber as u32;
            }
            if call.total_bits > 0 {
                call.ber = call.total_errors as f32 / call.total_bits as f32;
            }
            if p.rssi > 0 {
                call.rssi = (call.rssi + p.rssi as f32) / 2.0;
            }

            tracked.call_data.push(p.dmr_data);
            tracked.record.clone()
        };

        self.publish(&updated).await;
    }

    /// Closes the call: key-bounces are erased, everything else is
    /// finalized, persisted, and published.
    pub async fn end_call(self: &Arc<Self>, fp: u64) {
        let Some((_, tracked)) = self.active.remove(&fp) else {
            return;
        };
        if let Some((_, timer)) = self.timers.remove(&fp) {
            timer.abort();
        }

        let mut record = tracked.record;

        if tracked.started.elapsed() < KEY_BOUNCE {
            debug!(stream = record.stream_id, "key-bounce, erasing call");
            if let Err(e) = self.repo.delete_call(record.id).await {
                warn!("call erase failed: {e}");
            }
            self.metrics.call_ended(0.0, 0.0);
            return;
        }

        record.active = false;
        record.duration_ms = (Utc::now() - record.start_time).num_milliseconds();
        if let Err(e) = self.repo.save_call(&record).await {
            warn!("call finalize failed: {e}");
        }
        self.publish(&record).await;
        self.metrics
            .call_ended(record.loss as f64, record.duration_ms as f64 / 1000.0);
    }

    /// Arms (or re-arms) the end-of-call timer for a fingerprint.
    fn arm_timer(self: &Arc<Self>, fp: u64) {
        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(CALL_END_TIMEOUT).await;
            // Drop our own handle first so end_call cannot abort us mid-way.
            tracker.timers.remove(&fp);
            tracker.end_call(fp).await;
        });
        if let Some(previous) = self.timers.insert(fp, handle) {
            previous.abort();
        }
    }

    async fn publish(&self, record: &CallRecord) {
        let payload = match serde_json::to_vec(record) {
            Ok(v) => Bytes::from(v),
            Err(e) => {
                warn!("call encode failed: {e}");
                return;
            }
        };

        let _ = self.bus.publish(topics::CALLS, payload.clone()).await;
        if record.target.is_public() {
            let _ = self.bus.publish(topics::CALLS_PUBLIC, payload.clone()).await;
        }
        let _ = self.bus.publish(&topics::calls_user(record.user_id.0), payload).await;
    }
}

/// The sequence-loss state machine. Credits for missed bursts count both
/// as lost and as expected packets, which keeps `lost <= total` by
/// construction; a credit that would push loss past 1.0 indicates corrupt
/// sequencing and is rolled back whole.
fn apply_sequence(call: &mut CallRecord, p: &Packet) {
    let prev = (call.total_packets, call.lost_sequences, call.loss);

    match p.frame_type {
        FrameType::DataSync if p.dtype_or_vseq == DTYPE_VOICE_HEAD => {
            call.has_header = true;
            call.last_frame_num = 0;
            call.total_packets = call.total_packets.wrapping_add(1);
        }
        FrameType::DataSync if p.dtype_or_vseq == DTYPE_VOICE_TERM => {
            // The terminator closes the superframe early; bursts that never
            // came are not held against the link.
            call.has_term = true;
            call.last_frame_num = 0;
        }
        FrameType::DataSync => {
            call.total_packets = call.total_packets.wrapping_add(1);
        }
        FrameType::VoiceSync => {
            if !call.has_header && call.last_frame_num == 0 {
                // The header never arrived.
                call.lost_sequences = call.lost_sequences.wrapping_add(1);
                call.total_packets = call.total_packets.wrapping_add(1);
            }
            if call.last_frame_num != 0 && call.last_frame_num != VSEQ_F {
                let missed = (p.dtype_or_vseq as u32)
                    .wrapping_sub(call.last_frame_num as u32)
                    .wrapping_sub(1);
                call.lost_sequences = call.lost_sequences.wrapping_add(missed);
                call.total_packets = call.total_packets.wrapping_add(missed);
            }
            call.total_packets = call.total_packets.wrapping_add(1);
            call.last_frame_num = p.dtype_or_vseq;
        }
        FrameType::Voice => {
            if !call.has_header {
                let missed = 1 + p.dtype_or_vseq as u32;
                call.lost_sequences = call.lost_sequences.wrapping_add(missed);
                call.total_packets = call.total_packets.wrapping_add(missed);
                call.has_header = true;
            } else if p.dtype_or_vseq != call.last_frame_num.wrapping_add(1) {
                let missed = if p.dtype_or_vseq < call.last_frame_num {
                    // superframe wrapped
                    (VSEQ_F - call.last_frame_num) as u32 + p.dtype_or_vseq as u32
                } else {
                    (p.dtype_or_vseq as u32)
                        .wrapping_sub(call.last_frame_num as u32)
                        .wrapping_sub(1)
                };
                call.lost_sequences = call.lost_sequences.wrapping_add(missed);
                call.total_packets = call.total_packets.wrapping_add(missed);
            }
            call.total_packets = call.total_packets.wrapping_add(1);
            call.last_frame_num = p.dtype_or_vseq;
        }
    }

    if call.total_packets > 0 {
        let loss = call.lost_sequences as f32 / call.total_packets as f32;
        if loss > 1.0 {
            // Unsigned underflow in the credits: corrupt sequencing.
            (call.total_packets, call.lost_sequences, call.loss) = prev;
        } else {
            call.loss = loss;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rx_control::{MemoryHubRepo, Repeater, Talkgroup, User};
    use rx_bus::MemoryBus;
    use rx_dmr::packet::DMR_DATA_LEN;

    fn seed_repo() -> Arc<MemoryHubRepo> {
        let repo = Arc::new(MemoryHubRepo::new());
        repo.add_user(User { id: UserId(1_000_001), callsign: "W1AW".into(), approved: true });
        repo.add_repeater(Repeater::stub(RadioId(100_001), UserId(1_000_001), "pw".into()));
        repo.add_talkgroup(Talkgroup { id: TalkgroupId(91), name: "World".into(), description: String::new() });
        repo
    }

    fn tracker(repo: Arc<MemoryHubRepo>) -> Arc<CallTracker> {
        CallTracker::new(repo, Arc::new(MemoryBus::new()), HubMetrics::new("test"))
    }

    fn voice(seq: u8, frame_type: FrameType, vseq: u8) -> Packet {
        Packet {
            seq,
            src: 1_000_001,
            dst: 91,
            repeater_id: 100_001,
            slot: false,
            group_call: true,
            frame_type,
            dtype_or_vseq: vseq,
            stream_id: 0x5555,
            ber: 0,
            rssi: 0,
            dmr_data: [0u8; DMR_DATA_LEN],
        }
    }

    fn header(seq: u8) -> Packet {
        voice(seq, FrameType::DataSync, DTYPE_VOICE_HEAD)
    }

    fn term(seq: u8) -> Packet {
        voice(seq, FrameType::DataSync, DTYPE_VOICE_TERM)
    }

    #[test]
    fn fingerprint_is_stable_and_field_sensitive() {
        let p = voice(0, FrameType::Voice, 1);
        assert_eq!(fingerprint(&p), fingerprint(&p.clone()));

        let mut q = p.clone();
        q.stream_id ^= 1;
        assert_ne!(fingerprint(&p), fingerprint(&q));

        let mut r = p.clone();
        r.slot = true;
        assert_ne!(fingerprint(&p), fingerprint(&r));

        let mut s = p.clone();
        s.group_call = false;
        assert_ne!(fingerprint(&p), fingerprint(&s));

        // seq and payload are not part of the identity
        let mut t = p.clone();
        t.seq = 99;
        t.dmr_data = [1u8; DMR_DATA_LEN];
        assert_eq!(fingerprint(&p), fingerprint(&t));
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_loss_scenario() {
        // VoiceHeader, burst A (voice sync), B, D, terminator: one burst
        // lost between B and D.
        let repo = seed_repo();
        let tracker = tracker(repo.clone());

        tracker.handle_packet(&header(0)).await;
        let fp = fingerprint(&header(0));
        tracker.handle_packet(&voice(1, FrameType::VoiceSync, 0)).await;
        tracker.handle_packet(&voice(2, FrameType::Voice, 1)).await;
        tracker.handle_packet(&voice(3, FrameType::Voice, 3)).await;

        {
            let call = tracker.active.get(&fp).unwrap();
            assert_eq!(call.record.total_packets, 5);
            assert_eq!(call.record.lost_sequences, 1);
            assert!((call.record.loss - 0.2).abs() < f32::EPSILON);
        }

        // Hold the stream open past the key-bounce window, then terminate.
        tokio::time::advance(Duration::from_millis(200)).await;
        tracker.handle_packet(&term(4)).await;

        assert_eq!(tracker.active_calls(), 0);
        let last = repo.last_call_for_user(UserId(1_000_001)).await.unwrap().unwrap();
        assert_eq!(last.total_packets, 5);
        assert_eq!(last.lost_sequences, 1);
        assert!((last.loss - 0.2).abs() < f32::EPSILON);
        assert!(!last.active);
        assert!(last.has_term);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_superframe_has_no_loss() {
        let repo = seed_repo();
        let tracker = tracker(repo.clone());

        tracker.handle_packet(&header(0)).await;
        tracker.handle_packet(&voice(1, FrameType::VoiceSync, 0)).await;
        for (seq, vseq) in (2..7).zip(1..6) {
            tracker.handle_packet(&voice(seq, FrameType::Voice, vseq)).await;
        }

        let fp = fingerprint(&header(0));
        let call = tracker.active.get(&fp).unwrap();
        assert_eq!(call.record.total_packets, 7);
        assert_eq!(call.record.lost_sequences, 0);
        assert_eq!(call.record.loss, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_sequencing_rolls_back() {
        let repo = seed_repo();
        let tracker = tracker(repo.clone());

        tracker.handle_packet(&header(0)).await;
        // Burst B directly after the header: the expected-next arithmetic
        // underflows; the counters must roll back instead of exploding.
        tracker.handle_packet(&voice(1, FrameType::Voice, 0)).await;

        let fp = fingerprint(&header(0));
        let call = tracker.active.get(&fp).unwrap();
        assert!(call.record.loss <= 1.0);
        assert!(call.record.lost_sequences <= call.record.total_packets);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_seq_is_discarded() {
        let repo = seed_repo();
        let tracker = tracker(repo.clone());

        tracker.handle_packet(&header(7)).await;
        let fp = fingerprint(&header(7));
        let before = tracker.active.get(&fp).unwrap().record.total_packets;
        tracker.handle_packet(&header(7)).await;
        let after = tracker.active.get(&fp).unwrap().record.total_packets;
        assert_eq!(before, after);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_user_is_not_tracked() {
        let repo = seed_repo();
        let tracker = tracker(repo.clone());

        let mut p = header(0);
        p.src = 2_000_002;
        tracker.handle_packet(&p).await;
        assert_eq!(tracker.active_calls(), 0);
        assert_eq!(repo.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_timer_ends_call() {
        let repo = seed_repo();
        let tracker = tracker(repo.clone());

        tracker.handle_packet(&header(0)).await;
        assert_eq!(tracker.active_calls(), 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        tracker.handle_packet(&voice(1, FrameType::VoiceSync, 0)).await;

        tokio::time::advance(CALL_END_TIMEOUT + Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        assert_eq!(tracker.active_calls(), 0);
        let last = repo.last_call_for_user(UserId(1_000_001)).await.unwrap().unwrap();
        assert!(!last.active);
    }

    #[tokio::test(start_paused = true)]
    async fn key_bounce_is_erased() {
        let repo = seed_repo();
        let tracker = tracker(repo.clone());

        tracker.handle_packet(&header(0)).await;
        tracker.handle_packet(&term(1)).await;

        assert_eq!(tracker.active_calls(), 0);
        assert_eq!(repo.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_call_and_timer_per_fingerprint() {
        let repo = seed_repo();
        let tracker = tracker(repo.clone());

        tracker.handle_packet(&header(0)).await;
        tracker.handle_packet(&voice(1, FrameType::VoiceSync, 0)).await;
        tracker.handle_packet(&voice(2, FrameType::Voice, 1)).await;

        assert_eq!(tracker.active.len(), 1);
        assert_eq!(tracker.timers.len(), 1);
        assert_eq!(repo.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn private_call_resolves_user_target() {
        let repo = seed_repo();
        repo.add_user(User { id: UserId(1_000_002), callsign: "K1TTT".into(), approved: true });
        let tracker = tracker(repo.clone());

        let mut p = header(0);
        p.dst = 1_000_002;
        p.group_call = false;
        tracker.handle_packet(&p).await;

        assert_eq!(tracker.active_calls(), 1);
        let call = repo.last_call_for_user(UserId(1_000_001)).await.unwrap().unwrap();
        assert_eq!(call.target, CallTarget::User(UserId(1_000_002)));
        assert!(!call.group_call);
    }
}
