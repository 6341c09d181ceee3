//! HBRP command classification and reply builders.
//!
//! Inbound datagrams are classified by ASCII prefix. `RPTC` and `RPTCL`
//! share the first four bytes; the fifth byte disambiguates, so `RPTCL` is
//! checked first.

use crate::FrameError;

pub const DMRD: &[u8] = b"DMRD";
pub const DMRA: &[u8] = b"DMRA";
pub const RPTL: &[u8] = b"RPTL";
pub const RPTK: &[u8] = b"RPTK";
pub const RPTC: &[u8] = b"RPTC";
pub const RPTCL: &[u8] = b"RPTCL";
pub const RPTO: &[u8] = b"RPTO";
pub const RPTPING: &[u8] = b"RPTPING";
pub const MSTPONG: &[u8] = b"MSTPONG";
pub const MSTNAK: &[u8] = b"MSTNAK";
pub const MSTCL: &[u8] = b"MSTCL";
pub const RPTACK: &[u8] = b"RPTACK";
pub const RPTSBKN: &[u8] = b"RPTSBKN";

/// A classified inbound datagram. Payload slices borrow from the datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    /// 53/55-byte voice/data frame, handed to the packet codec whole.
    DmrData(&'a [u8]),
    /// Talker alias: radio id plus opaque alias data.
    TalkerAlias { radio_id: u32, alias: &'a [u8] },
    /// Login request.
    Login { radio_id: u32 },
    /// Challenge response: sha256(salt ++ password).
    Key { radio_id: u32, digest: &'a [u8; 32] },
    /// 302-byte config block, parsed separately by `config_block`.
    Config(&'a [u8]),
    /// Disconnect notice.
    Close { radio_id: u32 },
    /// Options string (talkgroup configuration).
    Options { radio_id: u32, options: &'a [u8] },
    /// Keepalive.
    Ping { radio_id: u32 },
}

impl<'a> Command<'a> {
    pub fn classify(data: &'a [u8]) -> Result<Command<'a>, FrameError> {
        if data.len() < 8 {
            return Err(FrameError::TooShort(data.len()));
        }

        if data.starts_with(DMRD) {
            if data.len() != 53 && data.len() != 55 {
                return Err(FrameError::BadLength(data.len()));
            }
            return Ok(Command::DmrData(data));
        }

        if data.starts_with(DMRA) {
            if data.len() < 15 {
                return Err(FrameError::TooShort(data.len()));
            }
            return Ok(Command::TalkerAlias { radio_id: id_at(data, 4), alias: &data[8..] });
        }

        if data.starts_with(RPTPING) {
            if data.len() < 11 {
                return Err(FrameError::TooShort(data.len()));
            }
            return Ok(Command::Ping { radio_id: id_at(data, 7) });
        }

        if data.starts_with(RPTCL) {
            return Ok(Command::Close { radio_id: id_at(data, data.len() - 4) });
        }

        if data.starts_with(RPTO) {
            if data.len() > 300 {
                return Err(FrameError::BadLength(data.len()));
            }
            return Ok(Command::Options { radio_id: id_at(data, 4), options: &data[8..] });
        }

        if data.starts_with(RPTC) {
            if data.len() != crate::config_block::BLOCK_LEN {
                return Err(FrameError::BadLength(data.len()));
            }
            return Ok(Command::Config(data));
        }

        if data.starts_with(RPTK) {
            if data.len() < 40 {
                return Err(FrameError::TooShort(data.len()));
            }
            let digest: &[u8; 32] = data[8..40].try_into().expect("32-byte slice");
            return Ok(Command::Key { radio_id: id_at(data, 4), digest });
        }

        if data.starts_with(RPTL) {
            return Ok(Command::Login { radio_id: id_at(data, 4) });
        }

        Err(FrameError::UnknownCommand)
    }
}

fn id_at(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

/// `RPTACK` carrying the login salt.
pub fn ack_with_salt(salt: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.extend_from_slice(RPTACK);
    out.extend_from_slice(&salt.to_be_bytes());
    out
}

pub fn ack(radio_id: u32) -> Vec<u8> {
    with_id(RPTACK, radio_id)
}

pub fn nak(radio_id: u32) -> Vec<u8> {
    with_id(MSTNAK, radio_id)
}

pub fn pong(radio_id: u32) -> Vec<u8> {
    with_id(MSTPONG, radio_id)
}

pub fn closing(radio_id: u32) -> Vec<u8> {
    with_id(MSTCL, radio_id)
}

pub fn beacon() -> Vec<u8> {
    RPTSBKN.to_vec()
}

fn with_id(prefix: &[u8], radio_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 4);
    out.extend_from_slice(prefix);
    out.extend_from_slice(&radio_id.to_be_bytes());
    out
}
