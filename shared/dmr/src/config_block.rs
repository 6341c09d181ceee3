//! RPTC repeater configuration block.
//!
//! 302 bytes: 4-byte command, 4-byte radio id, then ASCII-padded fields at
//! fixed offsets. A field that fails validation aborts the whole parse.

use crate::FrameError;

pub const BLOCK_LEN: usize = 302;

#[derive(Clone, Debug, PartialEq)]
pub struct ConfigBlock {
    pub radio_id: u32,
    pub callsign: String,
    pub rx_freq: u32,
    pub tx_freq: u32,
    pub tx_power: u8,
    pub color_code: u8,
    pub latitude: f32,
    pub longitude: f32,
    pub height: u16,
    pub location: String,
    pub description: String,
    pub slots: u8,
    pub url: String,
    pub software_id: String,
    pub package_id: String,
}

impl ConfigBlock {
    pub fn parse(data: &[u8]) -> Result<ConfigBlock, FrameError> {
        if data.len() != BLOCK_LEN {
            return Err(FrameError::BadLength(data.len()));
        }

        let radio_id = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        let callsign = text(&data[8..16], "callsign")?;
        let rx_freq = number::<u32>(&data[16..25], "rx_freq")?;
        let tx_freq = number::<u32>(&data[25..34], "tx_freq")?;
        // Power is clamped rather than rejected; hardware reports odd values.
        let tx_power = number::<u8>(&data[34..36], "tx_power")?.min(99);
        let color_code = number::<u8>(&data[36..38], "color_code")?;
        if color_code > 15 {
            return Err(FrameError::BadField("color_code"));
        }
        let latitude = float(&data[38..46], "latitude")?;
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(FrameError::BadField("latitude"));
        }
        let longitude = float(&data[46..55], "longitude")?;
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(FrameError::BadField("longitude"));
        }
        let height = number::<u16>(&data[55..58], "height")?;
        if height > 999 {
            return Err(FrameError::BadField("height"));
        }
        let location = text(&data[58..78], "location")?;
        let mut description = text(&data[78..97], "description")?;
        description.truncate(20);
        let slots = number::<u8>(&data[97..98], "slots")?;
        let url = text(&data[98..222], "url")?;
        let software_id = text(&data[222..262], "software_id")?;
        let package_id = text(&data[262..302], "package_id")?;

        Ok(ConfigBlock {
            radio_id,
            callsign,
            rx_freq,
            tx_freq,
            tx_power,
            color_code,
            latitude,
            longitude,
            height,
            location,
            description,
            slots,
            url,
            software_id,
            package_id,
        })
    }
}

fn text(raw: &[u8], field: &'static str) -> Result<String, FrameError> {
    let s = std::str::from_utf8(raw).map_err(|_| FrameError::BadField(field))?;
    Ok(s.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
}

fn number<T: std::str::FromStr>(raw: &[u8], field: &'static str) -> Result<T, FrameError> {
    text(raw, field)?.parse::<T>().map_err(|_| FrameError::BadField(field))
}

fn float(raw: &[u8], field: &'static str) -> Result<f32, FrameError> {
    text(raw, field)?.parse::<f32>().map_err(|_| FrameError::BadField(field))
}
