//! HBRP (MMDVM homebrew) server: login challenge, repeater configuration,
//! keepalive, and the DMRD dispatch that feeds the routing fabric.
//!
//! Session state machine:
//!
//! ```text
//! RPTL ──▶ CHALLENGE_SENT ──RPTK──▶ WAITING_CONFIG ──RPTC──▶ CONNECTED
//!                                                              │ RPTCL / 5 min silence
//!                                                              ▼
//!                                                         DISCONNECTED
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use rx_bus::{topics, MessageBus};
use rx_control::{HubRepo, RadioId, TalkgroupId, UserId};
use rx_dmr::{command, id, Command, ConfigBlock, FrameError, Packet};
use rx_metrics::HubMetrics;

use crate::calltracker::CallTracker;
use crate::envelope;
use crate::parrot::Parrot;
use crate::session::{ConnectionState, RepeaterSession, Sessions};
use crate::subscription::SubscriptionManager;

/// Delay before the RPTSBKN beacon that follows a successful challenge.
const BEACON_DELAY: Duration = Duration::from_secs(1);

pub struct HbrpServer {
    repo: Arc<dyn HubRepo>,
    sessions: Sessions,
    bus: Arc<dyn MessageBus>,
    tracker: Arc<CallTracker>,
    parrot: Arc<Parrot>,
    subs: Arc<SubscriptionManager>,
    metrics: HubMetrics,
    rng: SystemRandom,
}

impl HbrpServer {
    pub fn new(
        repo: Arc<dyn HubRepo>,
        sessions: Sessions,
        bus: Arc<dyn MessageBus>,
        tracker: Arc<CallTracker>,
        parrot: Arc<Parrot>,
        subs: Arc<SubscriptionManager>,
        metrics: HubMetrics,
    ) -> Self {
        Self {
            repo,
            sessions,
            bus,
            tracker,
            parrot,
            subs,
            metrics,
            rng: SystemRandom::new(),
        }
    }

    /// One of N tasks draining `hbrp:incoming`.
    pub async fn run_dispatcher(self: Arc<Self>) {
        let mut sub = match self.bus.subscribe(topics::HBRP_INCOMING).await {
            Ok(s) => s,
            Err(e) => {
                warn!("hbrp dispatcher subscribe failed: {e}");
                return;
            }
        };
        while let Some(payload) = sub.recv().await {
            let Some((addr, datagram)) = envelope::open(&payload) else {
                continue;
            };
            self.dispatch(addr, &datagram).await;
        }
    }

    pub async fn dispatch(self: &Arc<Self>, addr: SocketAddr, datagram: &[u8]) {
        let command = match Command::classify(datagram) {
            Ok(c) => c,
            Err(e) => {
                debug!(%addr, "unparseable datagram: {e}");
                self.metrics.hbrp_drop("invalid_frame");
                return;
            }
        };

        match command {
            Command::Login { radio_id } => self.handle_login(addr, radio_id).await,
            Command::Key { radio_id, digest } => self.handle_key(addr, radio_id, digest).await,
            Command::Config(block) => self.handle_config(addr, block).await,
            Command::Ping { radio_id } => self.handle_ping(addr, radio_id).await,
            Command::Close { .. } => self.handle_close(addr).await,
            Command::Options { radio_id, options } => {
                self.handle_options(addr, radio_id, options).await
            }
            Command::TalkerAlias { radio_id, .. } => {
                self.handle_talker_alias(addr, radio_id).await
            }
            Command::DmrData(frame) => self.handle_dmrd(addr, frame).await,
        }
    }

    async fn reply(&self, addr: SocketAddr, payload: Vec<u8>) {
        if let Err(e) = self
            .bus
            .publish(topics::HBRP_OUTGOING, envelope::seal(addr, &payload))
            .await
        {
            warn!(%addr, "reply publish failed: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    async fn handle_login(&self, addr: SocketAddr, radio_id: u32) {
        let repeater = match self.repo.get_repeater(RadioId(radio_id)).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                info!(radio_id, %addr, "login from unknown repeater refused");
                self.reply(addr, command::nak(radio_id)).await;
                return;
            }
            Err(e) => {
                warn!(radio_id, "repeater lookup failed: {e}");
                return;
            }
        };

        let mut salt_bytes = [0u8; 4];
        if self.rng.fill(&mut salt_bytes).is_err() {
            warn!(radio_id, "salt generation failed");
            return;
        }
        let salt = u32::from_be_bytes(salt_bytes);

        let mut session = RepeaterSession::new(radio_id, addr, salt);
        session.ts1_static = repeater.ts1_static.iter().map(|t| t.0).collect();
        session.ts2_static = repeater.ts2_static.iter().map(|t| t.0).collect();
        session.ts1_dynamic = repeater.ts1_dynamic.map(|t| t.0);
        session.ts2_dynamic = repeater.ts2_dynamic.map(|t| t.0);
        self.sessions.save(&session).await;

        debug!(radio_id, %addr, "challenge sent");
        self.reply(addr, command::ack_with_salt(salt)).await;
    }

    async fn handle_key(self: &Arc<Self>, addr: SocketAddr, radio_id: u32, digest: &[u8; 32]) {
        let Some(mut session) = self.sessions.load(radio_id).await else {
            self.reply(addr, command::nak(radio_id)).await;
            return;
        };
        if session.state != ConnectionState::ChallengeSent {
            self.reply(addr, command::nak(radio_id)).await;
            return;
        }

        let Ok(Some(repeater)) = self.repo.get_repeater(RadioId(radio_id)).await else {
            self.reply(addr, command::nak(radio_id)).await;
            return;
        };

        let expected = challenge_digest(session.salt, &repeater.password);
        if ring::constant_time::verify_slices_are_equal(&expected, digest).is_err() {
            info!(radio_id, %addr, got = %hex::encode(digest), "challenge response mismatch");
            self.sessions.remove(radio_id).await;
            self.reply(addr, command::nak(radio_id)).await;
            return;
        }

        session.state = ConnectionState::WaitingConfig;
        session.addr = addr;
        self.sessions.save(&session).await;
        self.reply(addr, command::ack(radio_id)).await;

        let server = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(BEACON_DELAY).await;
            server.reply(addr, command::beacon()).await;
        });
    }

    async fn handle_config(self: &Arc<Self>, addr: SocketAddr, block: &[u8]) {
        let cfg = match ConfigBlock::parse(block) {
            Ok(c) => c,
            Err(e) => {
                debug!(%addr, "invalid config block: {e}");
                self.metrics.hbrp_drop("invalid_config");
                return;
            }
        };

        let Some(mut session) = self.sessions.load(cfg.radio_id).await else {
            self.reply(addr, command::nak(cfg.radio_id)).await;
            return;
        };
        if session.state != ConnectionState::WaitingConfig {
            self.reply(addr, command::nak(cfg.radio_id)).await;
            return;
        }

        if let Ok(Some(mut repeater)) = self.repo.get_repeater(RadioId(cfg.radio_id)).await {
            repeater.ip = Some(addr.ip().to_string());
            repeater.port = Some(addr.port() as i32);
            repeater.callsign = cfg.callsign;
            repeater.rx_freq = cfg.rx_freq as i64;
            repeater.tx_freq = cfg.tx_freq as i64;
            repeater.tx_power = cfg.tx_power as i16;
            repeater.color_code = cfg.color_code as i16;
            repeater.latitude = cfg.latitude;
            repeater.longitude = cfg.longitude;
            repeater.height = cfg.height as i16;
            repeater.location = cfg.location;
            repeater.description = cfg.description;
            repeater.slots = cfg.slots as i16;
            repeater.url = cfg.url;
            repeater.software_id = cfg.software_id;
            repeater.package_id = cfg.package_id;
            repeater.last_ping = Some(Utc::now());
            if let Err(e) = self.repo.save_repeater(&repeater).await {
                warn!(radio_id = cfg.radio_id, "repeater persist failed: {e}");
            }
        }

        session.state = ConnectionState::Connected;
        session.addr = addr;
        session.last_ping = Utc::now();
        self.sessions.save(&session).await;
        self.subs.sync_for_session(cfg.radio_id).await;

        info!(radio_id = cfg.radio_id, %addr, "repeater connected");
        self.reply(addr, command::ack(cfg.radio_id)).await;
    }

    async fn handle_ping(&self, addr: SocketAddr, radio_id: u32) {
        let Some(mut session) = self.sessions.load(radio_id).await else {
            self.reply(addr, command::nak(radio_id)).await;
            return;
        };
        if session.state != ConnectionState::Connected {
            self.reply(addr, command::nak(radio_id)).await;
            return;
        }

        session.last_ping = Utc::now();
        session.addr = addr;
        self.sessions.save(&session).await;
        self.reply(addr, command::pong(radio_id)).await;
    }

    /// RPTCL carries an unreliable id field; the session is resolved by
    /// source address instead.
    async fn handle_close(&self, addr: SocketAddr) {
        let Some(session) = self
            .sessions
            .all()
            .await
            .into_iter()
            .find(|s| s.addr == addr)
        else {
            debug!(%addr, "close from unknown address");
            return;
        };

        info!(radio_id = session.radio_id, %addr, "repeater disconnected");
        self.reply(addr, command::nak(session.radio_id)).await;
        self.sessions.remove(session.radio_id).await;
        self.subs.cancel_all(session.radio_id);
    }

    /// RPTO talkgroup options: `TS1=<id,…>;TS2=<id,…>`. Unknown keys and
    /// unparsable ids are skipped; the original protocol is lenient here.
    async fn handle_options(self: &Arc<Self>, addr: SocketAddr, radio_id: u32, options: &[u8]) {
        let Some(mut session) = self.sessions.load(radio_id).await else {
            self.reply(addr, command::nak(radio_id)).await;
            return;
        };
        if session.state != ConnectionState::WaitingConfig
            && session.state != ConnectionState::Connected
        {
            self.reply(addr, command::nak(radio_id)).await;
            return;
        }

        let Ok(text) = std::str::from_utf8(options) else {
            self.reply(addr, command::nak(radio_id)).await;
            return;
        };
        let (ts1, ts2) = parse_options(text);
        if let Some(tgs) = ts1 {
            session.ts1_static = tgs;
        }
        if let Some(tgs) = ts2 {
            session.ts2_static = tgs;
        }
        self.sessions.save(&session).await;

        if let Ok(Some(mut repeater)) = self.repo.get_repeater(RadioId(radio_id)).await {
            repeater.ts1_static = session.ts1_static.iter().map(|t| TalkgroupId(*t)).collect();
            repeater.ts2_static = session.ts2_static.iter().map(|t| TalkgroupId(*t)).collect();
            if let Err(e) = self.repo.save_repeater(&repeater).await {
                warn!(radio_id, "repeater persist failed: {e}");
            }
        }

        if session.state == ConnectionState::Connected {
            self.subs.sync_for_session(radio_id).await;
        }
        self.reply(addr, command::ack(radio_id)).await;
    }

    async fn handle_talker_alias(&self, addr: SocketAddr, radio_id: u32) {
        let Some(mut session) = self.sessions.load(radio_id).await else {
            return;
        };
        if session.state != ConnectionState::Connected || session.addr != addr {
            return;
        }
        session.last_ping = Utc::now();
        self.sessions.save(&session).await;
        debug!(radio_id, "talker alias received");
    }

    // ------------------------------------------------------------------
    // DMRD dispatch
    // ------------------------------------------------------------------

    async fn handle_dmrd(self: &Arc<Self>, addr: SocketAddr, frame: &[u8]) {
        let packet = match Packet::decode(frame) {
            Ok(p) => p,
            Err(FrameError::ReservedFrameType) => {
                self.metrics.hbrp_drop("invalid_frame");
                return;
            }
            Err(e) => {
                debug!(%addr, "undecodable dmrd frame: {e}");
                self.metrics.hbrp_drop("invalid_frame");
                return;
            }
        };

        let Some(mut session) = self.sessions.load(packet.repeater_id).await else {
            self.reply(addr, command::nak(packet.repeater_id)).await;
            return;
        };
        if session.state != ConnectionState::Connected {
            self.reply(addr, command::nak(packet.repeater_id)).await;
            return;
        }
        if session.addr != addr {
            debug!(radio_id = packet.repeater_id, %addr, "dmrd from wrong address");
            self.metrics.hbrp_drop("address_mismatch");
            return;
        }

        session.last_ping = Utc::now();
        self.sessions.save(&session).await;

        self.tracker.handle_packet(&packet).await;

        let voice = packet.is_voice_traffic();

        if packet.dst == id::PARROT_USER && voice {
            // Parrot traffic stops here; it never enters the fabric.
            self.parrot.handle(packet, session.radio_id).await;
            return;
        }

        if packet.dst == id::TALKGROUP_UNLINK && voice {
            self.unlink_dynamic(session, packet.slot).await;
            return;
        }

        if packet.group_call && voice {
            let server = self.clone();
            let switch_packet = packet.clone();
            let radio_id = session.radio_id;
            // Fire and forget; linking must not block routing.
            tokio::spawn(async move {
                server.switch_dynamic(radio_id, switch_packet.slot, switch_packet.dst).await;
            });

            let wire = Bytes::copy_from_slice(frame);
            let _ = self.bus.publish(&topics::talkgroup_packets(packet.dst), wire.clone()).await;
            let _ = self.bus.publish(topics::OPENBRIDGE_PACKETS, wire).await;
            return;
        }

        if !packet.group_call && voice {
            self.route_private(&packet, frame).await;
        }
    }

    /// A voice packet to the reserved unlink id clears the dynamic
    /// talkgroup on the packet's slot.
    async fn unlink_dynamic(&self, mut session: RepeaterSession, slot: bool) {
        let cleared = if slot {
            session.ts2_dynamic.take()
        } else {
            session.ts1_dynamic.take()
        };
        let Some(talkgroup) = cleared else {
            return;
        };
        self.sessions.save(&session).await;

        if let Ok(Some(mut repeater)) = self.repo.get_repeater(RadioId(session.radio_id)).await {
            if slot {
                repeater.ts2_dynamic = None;
            } else {
                repeater.ts1_dynamic = None;
            }
            if let Err(e) = self.repo.save_repeater(&repeater).await {
                warn!(radio_id = session.radio_id, "repeater persist failed: {e}");
            }
        }

        info!(radio_id = session.radio_id, talkgroup, slot, "dynamic talkgroup unlinked");
        self.subs.cancel_subscription(session.radio_id, talkgroup).await;
    }

    /// Key-up on a talkgroup links it dynamically on that slot.
    async fn switch_dynamic(&self, radio_id: u32, slot: bool, talkgroup: u32) {
        let Some(mut session) = self.sessions.load(radio_id).await else {
            return;
        };
        let current = if slot { session.ts2_dynamic } else { session.ts1_dynamic };
        if current == Some(talkgroup) {
            return;
        }

        if slot {
            session.ts2_dynamic = Some(talkgroup);
        } else {
            session.ts1_dynamic = Some(talkgroup);
        }
        self.sessions.save(&session).await;

        if let Ok(Some(mut repeater)) = self.repo.get_repeater(RadioId(radio_id)).await {
            if slot {
                repeater.ts2_dynamic = Some(TalkgroupId(talkgroup));
            } else {
                repeater.ts1_dynamic = Some(TalkgroupId(talkgroup));
            }
            if let Err(e) = self.repo.save_repeater(&repeater).await {
                warn!(radio_id, "repeater persist failed: {e}");
            }
        }

        debug!(radio_id, talkgroup, slot, "dynamic talkgroup linked");
        self.subs.listen_for_talkgroup(radio_id, talkgroup);
        // The previous dynamic talkgroup's worker notices the change on
        // its next packet and exits by itself.
    }

    /// Private-call destination routing by id range.
    async fn route_private(&self, packet: &Packet, frame: &[u8]) {
        let wire = Bytes::copy_from_slice(frame);
        match id::classify(packet.dst) {
            id::Destination::Repeater | id::Destination::Hotspot => {
                let _ = self
                    .bus
                    .publish(&topics::repeater_packets(packet.dst), wire)
                    .await;
            }
            id::Destination::User => {
                // The user's last heard repeater gets the call, along with
                // every connected repeater they own. No freshness bound is
                // applied to the last call.
                let last_repeater = match self.repo.last_call_for_user(UserId(packet.dst)).await {
                    Ok(Some(call)) => {
                        let _ = self
                            .bus
                            .publish(&topics::repeater_packets(call.repeater_id.0), wire.clone())
                            .await;
                        Some(call.repeater_id)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(dst = packet.dst, "last call lookup failed: {e}");
                        None
                    }
                };

                let owned = match self.repo.list_repeaters_for_owner(UserId(packet.dst)).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(dst = packet.dst, "owner repeater lookup failed: {e}");
                        return;
                    }
                };
                for repeater in owned {
                    if Some(repeater.id) == last_repeater {
                        continue;
                    }
                    if self.sessions.registered(repeater.id.0).await {
                        let _ = self
                            .bus
                            .publish(&topics::repeater_packets(repeater.id.0), wire.clone())
                            .await;
                    }
                }
            }
            id::Destination::Other => {
                debug!(dst = packet.dst, "private call outside routable ranges");
                self.metrics.hbrp_drop("unroutable");
            }
        }
    }

    /// Graceful shutdown: close every session and stop its workers.
    pub async fn shutdown(&self) {
        for mut session in self.sessions.all().await {
            self.reply(session.addr, command::closing(session.radio_id)).await;
            session.state = ConnectionState::Disconnected;
            self.sessions.save(&session).await;
            self.subs.cancel_all(session.radio_id);
        }
    }
}

fn challenge_digest(salt: u32, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.to_be_bytes());
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn parse_options(text: &str) -> (Option<Vec<u32>>, Option<Vec<u32>>) {
    let mut ts1 = None;
    let mut ts2 = None;
    for pair in text.split(';') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let tgs: Vec<u32> = value
            .split(',')
            .filter_map(|v| v.trim().parse().ok())
            .collect();
        match key.trim() {
            "TS1" => ts1 = Some(tgs),
            "TS2" => ts2 = Some(tgs),
            _ => {}
        }
    }
    (ts1, ts2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rx_bus::{MemoryBus, MemorySessionStore, SessionStore, Subscription};
    use rx_control::{MemoryHubRepo, Repeater, Talkgroup, User};
    use rx_dmr::config_block::BLOCK_LEN;
    use rx_dmr::packet::{FrameType, DTYPE_VOICE_HEAD};

    struct Fixture {
        server: Arc<HbrpServer>,
        bus: Arc<dyn MessageBus>,
        repo: Arc<MemoryHubRepo>,
        sessions: Sessions,
        subs: Arc<SubscriptionManager>,
        out: Subscription,
    }

    async fn fixture() -> Fixture {
        let repo = Arc::new(MemoryHubRepo::new());
        repo.add_user(User { id: UserId(1_000_001), callsign: "W1AW".into(), approved: true });
        repo.add_user(User { id: UserId(1_000_002), callsign: "K1TTT".into(), approved: true });
        repo.add_repeater(Repeater::stub(RadioId(100_001), UserId(1_000_001), "pw".into()));
        repo.add_talkgroup(Talkgroup { id: TalkgroupId(91), name: "World".into(), description: String::new() });

        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let sessions = Sessions::new(store.clone());
        let metrics = HubMetrics::new("test");

        let tracker = CallTracker::new(repo.clone(), bus.clone(), metrics);
        let subs = Arc::new(SubscriptionManager::new(bus.clone(), sessions.clone(), metrics));
        let parrot = Arc::new(Parrot::new(store, bus.clone(), tracker.clone()));

        let out = bus.subscribe(topics::HBRP_OUTGOING).await.unwrap();
        let server = Arc::new(HbrpServer::new(
            repo.clone(),
            sessions.clone(),
            bus.clone(),
            tracker,
            parrot,
            subs.clone(),
            metrics,
        ));
        Fixture { server, bus, repo, sessions, subs, out }
    }

    fn addr() -> SocketAddr {
        "10.7.7.7:50123".parse().unwrap()
    }

    async fn next_reply(out: &mut Subscription) -> (SocketAddr, Bytes) {
        let payload = tokio::time::timeout(Duration::from_secs(1), out.recv())
            .await
            .expect("reply")
            .unwrap();
        envelope::open(&payload).unwrap()
    }

    fn login_frame(radio_id: u32) -> Vec<u8> {
        let mut v = b"RPTL".to_vec();
        v.extend_from_slice(&radio_id.to_be_bytes());
        v
    }

    fn key_frame(radio_id: u32, digest: &[u8; 32]) -> Vec<u8> {
        let mut v = b"RPTK".to_vec();
        v.extend_from_slice(&radio_id.to_be_bytes());
        v.extend_from_slice(digest);
        v
    }

    fn config_frame(radio_id: u32) -> Vec<u8> {
        let mut block = vec![b' '; BLOCK_LEN];
        block[0..4].copy_from_slice(b"RPTC");
        block[4..8].copy_from_slice(&radio_id.to_be_bytes());
        let fields: [(usize, &str); 13] = [
            (8, "W1AW"),
            (16, "438800000"),
            (25, "431200000"),
            (34, "25"),
            (36, "01"),
            (38, "41.7147"),
            (46, "-72.7272"),
            (55, "120"),
            (58, "Newington CT"),
            (78, "HQ repeater"),
            (97, "2"),
            (98, "https://example.net"),
            (222, "20240101"),
        ];
        for (off, value) in fields {
            block[off..off + value.len()].copy_from_slice(value.as_bytes());
        }
        block
    }

    fn ping_frame(radio_id: u32) -> Vec<u8> {
        let mut v = b"RPTPING".to_vec();
        v.extend_from_slice(&radio_id.to_be_bytes());
        v
    }

    async fn connect(f: &mut Fixture) {
        f.server.dispatch(addr(), &login_frame(100_001)).await;
        let (_, reply) = next_reply(&mut f.out).await;
        assert!(reply.starts_with(b"RPTACK"));
        let salt = u32::from_be_bytes([reply[6], reply[7], reply[8], reply[9]]);

        let digest = challenge_digest(salt, "pw");
        f.server.dispatch(addr(), &key_frame(100_001, &digest)).await;
        let (_, reply) = next_reply(&mut f.out).await;
        assert!(reply.starts_with(b"RPTACK"));

        f.server.dispatch(addr(), &config_frame(100_001)).await;
        let (_, reply) = next_reply(&mut f.out).await;
        assert!(reply.starts_with(b"RPTACK"));
    }

    fn voice_packet(dst: u32, group_call: bool, slot: bool) -> Vec<u8> {
        Packet {
            seq: 1,
            src: 1_000_001,
            dst,
            repeater_id: 100_001,
            slot,
            group_call,
            frame_type: FrameType::DataSync,
            dtype_or_vseq: DTYPE_VOICE_HEAD,
            stream_id: 4242,
            ..Packet::default()
        }
        .encode()
        .to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn full_handshake() {
        let mut f = fixture().await;
        connect(&mut f).await;

        let session = f.sessions.load(100_001).await.unwrap();
        assert_eq!(session.state, ConnectionState::Connected);
        assert_eq!(session.addr, addr());

        // RPTC metadata landed in the datastore.
        let repeater = f.repo.get_repeater(RadioId(100_001)).await.unwrap().unwrap();
        assert_eq!(repeater.callsign, "W1AW");
        assert_eq!(repeater.ip.as_deref(), Some("10.7.7.7"));

        // The beacon follows one second after the challenge succeeds.
        tokio::time::advance(BEACON_DELAY).await;
        let (_, beacon) = next_reply(&mut f.out).await;
        assert_eq!(&beacon[..], b"RPTSBKN");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_repeater_login_is_refused() {
        let mut f = fixture().await;
        f.server.dispatch(addr(), &login_frame(999_999)).await;
        let (_, reply) = next_reply(&mut f.out).await;
        assert!(reply.starts_with(b"MSTNAK"));
        assert!(f.sessions.load(999_999).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_password_drops_session() {
        let mut f = fixture().await;
        f.server.dispatch(addr(), &login_frame(100_001)).await;
        let _ = next_reply(&mut f.out).await;

        let digest = challenge_digest(0xBAD, "wrong");
        f.server.dispatch(addr(), &key_frame(100_001, &digest)).await;
        let (_, reply) = next_reply(&mut f.out).await;
        assert!(reply.starts_with(b"MSTNAK"));
        assert!(f.sessions.load(100_001).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn key_in_wrong_state_is_refused() {
        let mut f = fixture().await;
        connect(&mut f).await;

        // A second RPTK after connecting is a state violation.
        let digest = challenge_digest(1, "pw");
        f.server.dispatch(addr(), &key_frame(100_001, &digest)).await;
        let (_, reply) = next_reply(&mut f.out).await;
        assert!(reply.starts_with(b"MSTNAK"));
    }

    #[tokio::test(start_paused = true)]
    async fn ping_pongs_when_connected() {
        let mut f = fixture().await;
        connect(&mut f).await;

        f.server.dispatch(addr(), &ping_frame(100_001)).await;
        let (reply_addr, reply) = next_reply(&mut f.out).await;
        assert_eq!(reply_addr, addr());
        assert!(reply.starts_with(b"MSTPONG"));
    }

    #[tokio::test(start_paused = true)]
    async fn ping_without_session_naks() {
        let mut f = fixture().await;
        f.server.dispatch(addr(), &ping_frame(100_001)).await;
        let (_, reply) = next_reply(&mut f.out).await;
        assert!(reply.starts_with(b"MSTNAK"));
    }

    #[tokio::test(start_paused = true)]
    async fn close_removes_session_and_workers() {
        let mut f = fixture().await;
        connect(&mut f).await;

        let mut frame = b"RPTCL".to_vec();
        frame.extend_from_slice(&100_001u32.to_be_bytes());
        f.server.dispatch(addr(), &frame).await;

        let (_, reply) = next_reply(&mut f.out).await;
        assert!(reply.starts_with(b"MSTNAK"));
        assert!(f.sessions.load(100_001).await.is_none());
        assert_eq!(f.subs.worker_count(100_001), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn options_set_static_talkgroups() {
        let mut f = fixture().await;
        connect(&mut f).await;

        let mut frame = b"RPTO".to_vec();
        frame.extend_from_slice(&100_001u32.to_be_bytes());
        frame.extend_from_slice(b"TS1=91,92;TS2=310");
        f.server.dispatch(addr(), &frame).await;
        let (_, reply) = next_reply(&mut f.out).await;
        assert!(reply.starts_with(b"RPTACK"));

        let session = f.sessions.load(100_001).await.unwrap();
        assert_eq!(session.ts1_static, vec![91, 92]);
        assert_eq!(session.ts2_static, vec![310]);

        let repeater = f.repo.get_repeater(RadioId(100_001)).await.unwrap().unwrap();
        assert_eq!(repeater.ts1_static, vec![TalkgroupId(91), TalkgroupId(92)]);
    }

    #[tokio::test(start_paused = true)]
    async fn group_voice_fans_out_and_links_dynamic() {
        let mut f = fixture().await;
        connect(&mut f).await;

        let mut tg = f.bus.subscribe(&topics::talkgroup_packets(91)).await.unwrap();
        let mut ob = f.bus.subscribe(topics::OPENBRIDGE_PACKETS).await.unwrap();

        f.server.dispatch(addr(), &voice_packet(91, true, true)).await;

        let frame = tokio::time::timeout(Duration::from_secs(1), tg.recv()).await.unwrap().unwrap();
        assert_eq!(Packet::decode(&frame).unwrap().dst, 91);
        let frame = tokio::time::timeout(Duration::from_secs(1), ob.recv()).await.unwrap().unwrap();
        assert_eq!(Packet::decode(&frame).unwrap().dst, 91);

        // The fire-and-forget switcher links TS2 dynamic to 91.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let session = f.sessions.load(100_001).await.unwrap();
        assert_eq!(session.ts2_dynamic, Some(91));
        assert!(f.subs.worker_count(100_001) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parrot_traffic_never_reaches_fabric() {
        let mut f = fixture().await;
        f.repo.add_user(User { id: UserId(id::PARROT_USER), callsign: "PARROT".into(), approved: true });
        connect(&mut f).await;

        let mut tg = f.bus.subscribe(&topics::talkgroup_packets(id::PARROT_USER)).await.unwrap();
        let mut rp = f.bus.subscribe(&topics::repeater_packets(id::PARROT_USER)).await.unwrap();

        f.server.dispatch(addr(), &voice_packet(id::PARROT_USER, false, false)).await;

        assert!(tokio::time::timeout(Duration::from_millis(100), tg.recv()).await.is_err());
        assert!(tokio::time::timeout(Duration::from_millis(100), rp.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unlink_clears_dynamic_and_cancels_worker() {
        let mut f = fixture().await;
        connect(&mut f).await;

        // Key up on 91 to link it dynamically on TS2.
        f.server.dispatch(addr(), &voice_packet(91, true, true)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.sessions.load(100_001).await.unwrap().ts2_dynamic, Some(91));

        // Transmit to 4000 on TS2.
        let mut unlink = Packet::decode(&voice_packet(id::TALKGROUP_UNLINK, true, true)).unwrap();
        unlink.stream_id = 777;
        f.server.dispatch(addr(), &unlink.encode()).await;

        let session = f.sessions.load(100_001).await.unwrap();
        assert_eq!(session.ts2_dynamic, None);
        // Only the repeater-topic worker remains.
        assert_eq!(f.subs.worker_count(100_001), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn private_call_routes_by_range() {
        let mut f = fixture().await;
        connect(&mut f).await;

        // Repeater range goes straight to the repeater topic.
        let mut direct = f.bus.subscribe(&topics::repeater_packets(100_555)).await.unwrap();
        f.server.dispatch(addr(), &voice_packet(100_555, false, false)).await;
        let frame = tokio::time::timeout(Duration::from_secs(1), direct.recv()).await.unwrap().unwrap();
        assert_eq!(Packet::decode(&frame).unwrap().dst, 100_555);
    }

    #[tokio::test(start_paused = true)]
    async fn private_call_follows_last_heard_user() {
        let mut f = fixture().await;
        connect(&mut f).await;

        // 1000002 was last heard on repeater 100777.
        let last = rx_control::CallRecord {
            id: rx_control::CallId::new(),
            stream_id: 1,
            user_id: UserId(1_000_002),
            repeater_id: RadioId(100_777),
            target: rx_control::model::CallTarget::Talkgroup(TalkgroupId(91)),
            start_time: Utc::now(),
            last_packet_time: Utc::now(),
            duration_ms: 1000,
            active: false,
            time_slot: false,
            group_call: true,
            last_seq: None,
            last_frame_num: 0,
            total_packets: 10,
            lost_sequences: 0,
            loss: 0.0,
            jitter: 0.0,
            total_bits: 0,
            total_errors: 0,
            ber: 0.0,
            rssi: 0.0,
            has_header: true,
            has_term: true,
        };
        f.repo.create_call(&last).await.unwrap();

        let mut target = f.bus.subscribe(&topics::repeater_packets(100_777)).await.unwrap();
        f.server.dispatch(addr(), &voice_packet(1_000_002, false, false)).await;

        let frame = tokio::time::timeout(Duration::from_secs(1), target.recv()).await.unwrap().unwrap();
        assert_eq!(Packet::decode(&frame).unwrap().dst, 1_000_002);
    }

    #[tokio::test(start_paused = true)]
    async fn dmrd_from_unregistered_repeater_naks() {
        let mut f = fixture().await;
        f.server.dispatch(addr(), &voice_packet(91, true, false)).await;
        let (_, reply) = next_reply(&mut f.out).await;
        assert!(reply.starts_with(b"MSTNAK"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_all_sessions() {
        let mut f = fixture().await;
        connect(&mut f).await;

        f.server.shutdown().await;
        let (_, reply) = next_reply(&mut f.out).await;
        assert!(reply.starts_with(b"MSTCL"));

        let session = f.sessions.load(100_001).await.unwrap();
        assert_eq!(session.state, ConnectionState::Disconnected);
    }
}
