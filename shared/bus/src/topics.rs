//! Bus topic names used across the hub.

pub const HBRP_INCOMING: &str = "hbrp:incoming";
pub const HBRP_OUTGOING: &str = "hbrp:outgoing";
pub const HBRP_OUTGOING_NOADDR: &str = "hbrp:outgoing:noaddr";

pub const OPENBRIDGE_INCOMING: &str = "openbridge:incoming";
pub const OPENBRIDGE_OUTGOING: &str = "openbridge:outgoing";
pub const OPENBRIDGE_PACKETS: &str = "openbridge:packets";

pub const CALLS: &str = "calls";
pub const CALLS_PUBLIC: &str = "calls:public";

/// Private-call delivery for one repeater.
pub fn repeater_packets(radio_id: u32) -> String {
    format!("hbrp:packets:repeater:{radio_id}")
}

/// Group-call fan-out for one talkgroup.
pub fn talkgroup_packets(talkgroup_id: u32) -> String {
    format!("hbrp:packets:talkgroup:{talkgroup_id}")
}

/// Per-user call event stream.
pub fn calls_user(user_id: u32) -> String {
    format!("calls:{user_id}")
}
