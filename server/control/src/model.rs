use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CallId, PeerId, RadioId, TalkgroupId, UserId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub callsign: String,
    pub approved: bool,
}

/// Repeater row. Static talkgroup memberships and the current dynamic
/// talkgroup per slot are persisted here; the live session (address, salt,
/// connection state) lives in the session store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Repeater {
    pub id: RadioId,
    pub owner_id: UserId,
    pub password: String,
    pub ip: Option<String>,
    pub port: Option<i32>,
    pub callsign: String,
    pub rx_freq: i64,
    pub tx_freq: i64,
    pub tx_power: i16,
    pub color_code: i16,
    pub latitude: f32,
    pub longitude: f32,
    pub height: i16,
    pub location: String,
    pub description: String,
    pub slots: i16,
    pub url: String,
    pub software_id: String,
    pub package_id: String,
    pub ts1_static: Vec<TalkgroupId>,
    pub ts2_static: Vec<TalkgroupId>,
    pub ts1_dynamic: Option<TalkgroupId>,
    pub ts2_dynamic: Option<TalkgroupId>,
    pub last_ping: Option<DateTime<Utc>>,
}

impl Repeater {
    /// Minimal row created on first contact; RPTC fills in the rest.
    pub fn stub(id: RadioId, owner_id: UserId, password: String) -> Self {
        Repeater {
            id,
            owner_id,
            password,
            ip: None,
            port: None,
            callsign: String::new(),
            rx_freq: 0,
            tx_freq: 0,
            tx_power: 0,
            color_code: 1,
            latitude: 0.0,
            longitude: 0.0,
            height: 0,
            location: String::new(),
            description: String::new(),
            slots: 2,
            url: String::new(),
            software_id: String::new(),
            package_id: String::new(),
            ts1_static: Vec::new(),
            ts2_static: Vec::new(),
            ts1_dynamic: None,
            ts2_dynamic: None,
            last_ping: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Talkgroup {
    pub id: TalkgroupId,
    pub name: String,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

/// Inclusive subject-id range filter on an OpenBridge peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRule {
    pub peer_id: PeerId,
    pub direction: RuleDirection,
    pub subject_id_min: u32,
    pub subject_id_max: u32,
}

impl PeerRule {
    pub fn contains(&self, subject: u32) -> bool {
        self.subject_id_min <= subject && subject <= self.subject_id_max
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub owner_id: UserId,
    pub password: String,
    pub ip: Option<String>,
    pub port: Option<i32>,
    pub ingress: bool,
    pub egress: bool,
    pub ingress_rules: Vec<PeerRule>,
    pub egress_rules: Vec<PeerRule>,
}

impl Peer {
    /// Ingress rules apply to the packet destination.
    pub fn should_ingress(&self, dst: u32) -> bool {
        self.ingress && self.ingress_rules.iter().any(|r| r.contains(dst))
    }

    /// Egress rules apply to the packet source.
    pub fn should_egress(&self, src: u32) -> bool {
        self.egress && self.egress_rules.iter().any(|r| r.contains(src))
    }
}

/// Destination of a tracked call, denormalized for display and filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum CallTarget {
    Talkgroup(TalkgroupId),
    User(UserId),
    Repeater(RadioId),
}

impl CallTarget {
    /// Talkgroup and bridge-repeater calls show up on the public stream.
    pub fn is_public(&self) -> bool {
        !matches!(self, CallTarget::User(_))
    }
}

/// One tracked voice transmission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub stream_id: u32,
    pub user_id: UserId,
    pub repeater_id: RadioId,
    pub target: CallTarget,
    pub start_time: DateTime<Utc>,
    pub last_packet_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub active: bool,
    pub time_slot: bool,
    pub group_call: bool,
    pub last_seq: Option<u8>,
    pub last_frame_num: u8,
    pub total_packets: u32,
    pub lost_sequences: u32,
    pub loss: f32,
    pub jitter: f32,
    pub total_bits: u32,
    pub total_errors: u32,
    pub ber: f32,
    pub rssi: f32,
    pub has_header: bool,
    pub has_term: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(min: u32, max: u32, direction: RuleDirection) -> PeerRule {
        PeerRule { peer_id: PeerId(500_001), direction, subject_id_min: min, subject_id_max: max }
    }

    fn peer(ingress: bool, egress: bool) -> Peer {
        Peer {
            id: PeerId(500_001),
            owner_id: UserId(1_000_001),
            password: "p".into(),
            ip: None,
            port: None,
            ingress,
            egress,
            ingress_rules: vec![rule(1, 10, RuleDirection::Ingress)],
            egress_rules: vec![rule(1_000_000, 9_999_999, RuleDirection::Egress)],
        }
    }

    #[test]
    fn rule_ranges_are_inclusive() {
        let r = rule(5, 7, RuleDirection::Ingress);
        assert!(!r.contains(4));
        assert!(r.contains(5));
        assert!(r.contains(7));
        assert!(!r.contains(8));
    }

    #[test]
    fn ingress_requires_flag_and_rule() {
        assert!(peer(true, true).should_ingress(1));
        assert!(!peer(true, true).should_ingress(11));
        assert!(!peer(false, true).should_ingress(1));
    }

    #[test]
    fn egress_matches_source() {
        assert!(peer(true, true).should_egress(1_000_001));
        assert!(!peer(true, false).should_egress(1_000_001));
        assert!(!peer(true, true).should_egress(91));
    }

    #[test]
    fn user_calls_are_private() {
        assert!(CallTarget::Talkgroup(TalkgroupId(91)).is_public());
        assert!(CallTarget::Repeater(RadioId(100_001)).is_public());
        assert!(!CallTarget::User(UserId(1_000_001)).is_public());
    }
}
