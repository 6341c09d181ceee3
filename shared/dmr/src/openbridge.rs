//! OpenBridge framing: a 53-byte DMRD payload followed by a 20-byte
//! HMAC-SHA1 trailer keyed with the peer password. Verification is
//! constant-time via `ring`.

use ring::hmac;

use crate::packet::{Packet, FRAME_LEN};
use crate::FrameError;

pub const TAG_LEN: usize = 20;
pub const FRAME_LEN_OPENBRIDGE: usize = FRAME_LEN + TAG_LEN;

/// Encode and sign a packet for a peer. OpenBridge is TS1-only; callers
/// must have dropped TS2 traffic already.
pub fn seal(packet: &Packet, key: &[u8]) -> [u8; FRAME_LEN_OPENBRIDGE] {
    let payload = packet.encode();
    let tag = hmac::sign(&hmac_key(key), &payload);

    let mut out = [0u8; FRAME_LEN_OPENBRIDGE];
    out[..FRAME_LEN].copy_from_slice(&payload);
    out[FRAME_LEN..].copy_from_slice(tag.as_ref());
    out
}

/// Verify the trailer and decode the payload.
pub fn open(data: &[u8], key: &[u8]) -> Result<Packet, FrameError> {
    let payload = verify(data, key)?;
    Packet::decode(payload)
}

/// Verify the trailer only, returning the payload slice.
pub fn verify<'a>(data: &'a [u8], key: &[u8]) -> Result<&'a [u8], FrameError> {
    if data.len() != FRAME_LEN_OPENBRIDGE {
        return Err(FrameError::BadLength(data.len()));
    }
    let (payload, tag) = data.split_at(FRAME_LEN);
    hmac::verify(&hmac_key(key), payload, tag).map_err(|_| FrameError::BadTag)?;
    Ok(payload)
}

/// Peer id sits at the repeater-id offset of the embedded DMRD payload.
pub fn peer_id(data: &[u8]) -> Option<u32> {
    if data.len() < 15 {
        return None;
    }
    Some(u32::from_be_bytes([data[11], data[12], data[13], data[14]]))
}

fn hmac_key(key: &[u8]) -> hmac::Key {
    hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key)
}
