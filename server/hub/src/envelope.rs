//! Addressed datagram envelope for the UDP staging topics.
//!
//! The bus carries opaque bytes; the reader and sender tasks need the peer
//! address alongside the datagram. Layout: one length byte, the address in
//! its display form, then the payload.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

pub fn seal(addr: SocketAddr, payload: &[u8]) -> Bytes {
    let text = addr.to_string();
    let mut out = BytesMut::with_capacity(1 + text.len() + payload.len());
    out.put_u8(text.len() as u8);
    out.put_slice(text.as_bytes());
    out.put_slice(payload);
    out.freeze()
}

pub fn open(data: &[u8]) -> Option<(SocketAddr, Bytes)> {
    let (&len, rest) = data.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let addr = std::str::from_utf8(&rest[..len]).ok()?.parse().ok()?;
    Some((addr, Bytes::copy_from_slice(&rest[len..])))
}
