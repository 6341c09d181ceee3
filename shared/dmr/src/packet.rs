//! DMRD voice/data frame codec.
//!
//! Layout (53 bytes, optionally 55 with a BER/RSSI trailer):
//!
//! ```text
//!  0:  [u8;4] signature      "DMRD"
//!  4:  u8     seq
//!  5:  u24    src            (big-endian DMR id)
//!  8:  u24    dst            (big-endian DMR id)
//! 11:  u32    repeater_id    (big-endian, ingress identifier)
//! 15:  u8     bits           (bit7 slot, bit6 unit-call, bits5-4 frame type,
//!                             bits3-0 data type / voice sequence)
//! 16:  u32    stream_id      (big-endian, call-scoped random id)
//! 20:  [u8;33] dmr_data      (opaque voice burst)
//! 53:  i8     ber            (optional trailer)
//! 54:  i8     rssi
//! ```

use crate::FrameError;

pub const SIGNATURE: &[u8; 4] = b"DMRD";
pub const FRAME_LEN: usize = 53;
pub const FRAME_LEN_SIGNAL: usize = 55;

/// Voice burst payload width.
pub const DMR_DATA_LEN: usize = 33;

/// Data types carried in a DataSync frame.
pub const DTYPE_VOICE_HEAD: u8 = 0x01;
pub const DTYPE_VOICE_TERM: u8 = 0x02;

/// Voice sequence positions within a superframe, A through F.
pub const VSEQ_A: u8 = 0;
pub const VSEQ_F: u8 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    Voice,
    VoiceSync,
    DataSync,
}

impl FrameType {
    fn from_bits(v: u8) -> Result<Self, FrameError> {
        match v {
            0 => Ok(FrameType::Voice),
            1 => Ok(FrameType::VoiceSync),
            2 => Ok(FrameType::DataSync),
            _ => Err(FrameError::ReservedFrameType),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            FrameType::Voice => 0,
            FrameType::VoiceSync => 1,
            FrameType::DataSync => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub seq: u8,
    pub src: u32,
    pub dst: u32,
    pub repeater_id: u32,
    pub slot: bool,
    pub group_call: bool,
    pub frame_type: FrameType,
    pub dtype_or_vseq: u8,
    pub stream_id: u32,
    pub ber: i8,
    pub rssi: i8,
    pub dmr_data: [u8; DMR_DATA_LEN],
}

impl Packet {
    pub fn decode(data: &[u8]) -> Result<Packet, FrameError> {
        if data.len() != FRAME_LEN && data.len() != FRAME_LEN_SIGNAL {
            return Err(FrameError::BadLength(data.len()));
        }
        if &data[0..4] != SIGNATURE {
            return Err(FrameError::BadSignature);
        }

        let bits = data[15];
        let frame_type = FrameType::from_bits((bits >> 4) & 0x3)?;

        let mut dmr_data = [0u8; DMR_DATA_LEN];
        dmr_data.copy_from_slice(&data[20..53]);

        let (ber, rssi) = if data.len() == FRAME_LEN_SIGNAL {
            (data[53] as i8, data[54] as i8)
        } else {
            (0, 0)
        };

        Ok(Packet {
            seq: data[4],
            src: u24_be(&data[5..8]),
            dst: u24_be(&data[8..11]),
            repeater_id: u32::from_be_bytes([data[11], data[12], data[13], data[14]]),
            slot: bits & 0x80 != 0,
            group_call: bits & 0x40 == 0,
            frame_type,
            dtype_or_vseq: bits & 0x0F,
            stream_id: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            ber,
            rssi,
            dmr_data,
        })
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        out[0..4].copy_from_slice(SIGNATURE);
        out[4] = self.seq;
        out[5..8].copy_from_slice(&self.src.to_be_bytes()[1..4]);
        out[8..11].copy_from_slice(&self.dst.to_be_bytes()[1..4]);
        out[11..15].copy_from_slice(&self.repeater_id.to_be_bytes());

        let mut bits = self.dtype_or_vseq & 0x0F;
        bits |= self.frame_type.to_bits() << 4;
        if !self.group_call {
            bits |= 0x40;
        }
        if self.slot {
            bits |= 0x80;
        }
        out[15] = bits;

        out[16..20].copy_from_slice(&self.stream_id.to_be_bytes());
        out[20..53].copy_from_slice(&self.dmr_data);
        out
    }

    /// 55-byte form carrying the BER/RSSI trailer.
    pub fn encode_with_signal(&self) -> [u8; FRAME_LEN_SIGNAL] {
        let mut out = [0u8; FRAME_LEN_SIGNAL];
        out[0..FRAME_LEN].copy_from_slice(&self.encode());
        out[53] = self.ber as u8;
        out[54] = self.rssi as u8;
        out
    }

    /// True for the DataSync frame that opens a voice transmission.
    pub fn is_voice_header(&self) -> bool {
        self.frame_type == FrameType::DataSync && self.dtype_or_vseq == DTYPE_VOICE_HEAD
    }

    /// True for the DataSync frame that closes a voice transmission.
    pub fn is_voice_term(&self) -> bool {
        self.frame_type == FrameType::DataSync && self.dtype_or_vseq == DTYPE_VOICE_TERM
    }

    /// Voice in the wide sense: bursts, syncs, and the header/terminator.
    pub fn is_voice_traffic(&self) -> bool {
        match self.frame_type {
            FrameType::Voice | FrameType::VoiceSync => true,
            FrameType::DataSync => {
                self.dtype_or_vseq == DTYPE_VOICE_HEAD || self.dtype_or_vseq == DTYPE_VOICE_TERM
            }
        }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Packet {
            seq: 0,
            src: 0,
            dst: 0,
            repeater_id: 0,
            slot: false,
            group_call: true,
            frame_type: FrameType::Voice,
            dtype_or_vseq: 0,
            stream_id: 0,
            ber: 0,
            rssi: 0,
            dmr_data: [0u8; DMR_DATA_LEN],
        }
    }
}

fn u24_be(b: &[u8]) -> u32 {
    (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet {
            seq: 42,
            src: 3_120_001,
            dst: 91,
            repeater_id: 312_000_01,
            slot: true,
            group_call: true,
            frame_type: FrameType::VoiceSync,
            dtype_or_vseq: 3,
            stream_id: 0xDEAD_BEEF,
            ber: 2,
            rssi: -47,
            dmr_data: [0xA5; DMR_DATA_LEN],
        }
    }

    #[test]
    fn round_trip_53() {
        let mut p = sample();
        p.ber = 0;
        p.rssi = 0;
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn round_trip_55() {
        let p = sample();
        assert_eq!(Packet::decode(&p.encode_with_signal()).unwrap(), p);
    }

    #[test]
    fn decode_encode_idempotent() {
        let wire = sample().encode_with_signal();
        let once = Packet::decode(&wire).unwrap();
        let twice = Packet::decode(&once.encode_with_signal()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn private_call_bit() {
        let mut p = sample();
        p.group_call = false;
        let wire = p.encode();
        assert_eq!(wire[15] & 0x40, 0x40);
        assert!(!Packet::decode(&wire).unwrap().group_call);
    }

    #[test]
    fn rejects_bad_length() {
        assert_eq!(Packet::decode(&[0u8; 54]), Err(FrameError::BadLength(54)));
        assert_eq!(Packet::decode(&[0u8; 12]), Err(FrameError::BadLength(12)));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut wire = sample().encode();
        wire[0] = b'X';
        assert_eq!(Packet::decode(&wire), Err(FrameError::BadSignature));
    }

    #[test]
    fn rejects_reserved_frame_type() {
        let mut wire = sample().encode();
        wire[15] |= 0x30;
        assert_eq!(Packet::decode(&wire), Err(FrameError::ReservedFrameType));
    }

    #[test]
    fn trailer_carries_signal_quality() {
        let wire = sample().encode_with_signal();
        let p = Packet::decode(&wire).unwrap();
        assert_eq!(p.ber, 2);
        assert_eq!(p.rssi, -47);

        let bare = Packet::decode(&wire[..FRAME_LEN]).unwrap();
        assert_eq!(bare.ber, 0);
        assert_eq!(bare.rssi, 0);
    }
}
