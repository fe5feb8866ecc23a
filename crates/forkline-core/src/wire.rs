//! Binary encoding shared by the routing header and whole messages.
//!
//! Strings are written as a presence byte (`0` absent, `1` present) followed,
//! when present, by a big-endian `u16` byte length and the UTF-8 bytes.
//!
//! Message layout:
//! ```text
//! flags:u8 [dest:16] [src:16] header_count:u16
//!   { id:u16 len:u32 body }*
//! payload_len:u32 payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::header::{ROUTING_HEADER_ID, RoutingHeader};
use crate::message::{Header, Headers, Message};
use crate::types::Address;

const FLAG_DEST: u8 = 0x01;
const FLAG_SRC: u8 = 0x02;

/// Encoded size of an optional string.
pub fn string_len(s: Option<&str>) -> usize {
    s.map_or(1, |s| 1 + 2 + s.len())
}

pub fn put_string(buf: &mut impl BufMut, s: Option<&str>) -> Result<()> {
    match s {
        None => buf.put_u8(0),
        Some(s) => {
            let len = u16::try_from(s.len())
                .map_err(|_| Error::Codec(format!("string too long: {} bytes", s.len())))?;
            buf.put_u8(1);
            buf.put_u16(len);
            buf.put_slice(s.as_bytes());
        }
    }
    Ok(())
}

pub fn get_string(buf: &mut impl Buf) -> Result<Option<String>> {
    ensure(&*buf, 1, "string presence")?;
    match buf.get_u8() {
        0 => Ok(None),
        1 => {
            ensure(&*buf, 2, "string length")?;
            let len = usize::from(buf.get_u16());
            ensure(&*buf, len, "string bytes")?;
            let mut raw = vec![0; len];
            buf.copy_to_slice(&mut raw);
            String::from_utf8(raw)
                .map(Some)
                .map_err(|e| Error::Codec(format!("invalid UTF-8 in string: {e}")))
        }
        other => Err(Error::Codec(format!("invalid string presence byte {other}"))),
    }
}

/// Encode a message for transmission.
pub fn encode_message(msg: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64 + msg.payload.len());

    let mut flags = 0;
    if msg.dest.is_some() {
        flags |= FLAG_DEST;
    }
    if msg.src.is_some() {
        flags |= FLAG_SRC;
    }
    buf.put_u8(flags);
    if let Some(dest) = &msg.dest {
        buf.put_slice(dest.as_bytes());
    }
    if let Some(src) = &msg.src {
        buf.put_slice(src.as_bytes());
    }

    let count = u16::try_from(msg.headers.len())
        .map_err(|_| Error::Codec(format!("too many headers: {}", msg.headers.len())))?;
    buf.put_u16(count);
    for header in msg.headers.iter() {
        buf.put_u16(header.id());
        match header {
            Header::Routing(hdr) => {
                buf.put_u32(len_u32(hdr.encoded_len())?);
                hdr.encode(&mut buf)?;
            }
            Header::Opaque { data, .. } => {
                buf.put_u32(len_u32(data.len())?);
                buf.put_slice(data);
            }
        }
    }

    buf.put_u32(len_u32(msg.payload.len())?);
    buf.put_slice(&msg.payload);
    Ok(buf.freeze())
}

/// Decode a message produced by [`encode_message`].
pub fn decode_message(mut buf: Bytes) -> Result<Message> {
    ensure(&buf, 1, "flags")?;
    let flags = buf.get_u8();
    let dest = if flags & FLAG_DEST != 0 {
        Some(get_address(&mut buf)?)
    } else {
        None
    };
    let src = if flags & FLAG_SRC != 0 {
        Some(get_address(&mut buf)?)
    } else {
        None
    };

    ensure(&buf, 2, "header count")?;
    let count = buf.get_u16();
    let mut headers = Headers::new();
    for _ in 0..count {
        ensure(&buf, 6, "header prefix")?;
        let id = buf.get_u16();
        let len = buf.get_u32() as usize;
        ensure(&buf, len, "header body")?;
        let mut body = buf.split_to(len);
        let header = if id == ROUTING_HEADER_ID {
            let hdr = RoutingHeader::decode(&mut body)?;
            if body.has_remaining() {
                return Err(Error::Codec(format!(
                    "{} trailing bytes after routing header",
                    body.remaining()
                )));
            }
            Header::Routing(hdr)
        } else {
            Header::Opaque { id, data: body }
        };
        headers.put(header);
    }

    ensure(&buf, 4, "payload length")?;
    let len = buf.get_u32() as usize;
    ensure(&buf, len, "payload")?;
    let payload = buf.split_to(len);

    Ok(Message {
        dest,
        src,
        payload,
        headers,
    })
}

fn get_address(buf: &mut Bytes) -> Result<Address> {
    ensure(&*buf, 16, "address")?;
    let mut raw = [0; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Address::from_bytes(raw))
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Codec(format!("length {len} exceeds u32")))
}

fn ensure(buf: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::Codec(format!(
            "truncated {what}: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}
