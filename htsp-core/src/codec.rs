//! HTSP wire codec: length-prefixed, tagged, self-describing binary
//! frames.
//!
//! ## Wire format
//!
//! **Frame**:
//! ```text
//! length:  u32 BE      total length of the field list that follows
//! fields:  [u8]        field list of the root map (no wrapper field)
//! ```
//!
//! **Field**:
//! ```text
//! type:    u8          1=Map, 2=S64, 3=Str, 4=Bin, 5=List
//! namelen: u8
//! datalen: u32 BE
//! name:    namelen bytes (UTF-8, empty for List entries)
//! data:    datalen bytes
//! ```
//!
//! S64 data is a minimum-length big-endian two's-complement integer;
//! `datalen = 0` encodes the value 0. Map and List data are recursive
//! field lists whose total size equals `datalen`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::HtspError;
use crate::message::{HtspMessage, HtspValue};

/// Upper bound on a single frame body. Anything larger is treated as
/// a framing error rather than buffered.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const TYPE_MAP: u8 = 1;
const TYPE_S64: u8 = 2;
const TYPE_STR: u8 = 3;
const TYPE_BIN: u8 = 4;
const TYPE_LIST: u8 = 5;

const FIELD_HEADER_LEN: usize = 6;

// ── Serializer ───────────────────────────────────────────────────

/// Encode a message into a complete frame (length prefix included).
pub fn encode_frame(message: &HtspMessage) -> Result<Bytes, HtspError> {
    let mut body = BytesMut::new();
    encode_fields(message, &mut body)?;

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

fn encode_fields(message: &HtspMessage, dst: &mut BytesMut) -> Result<(), HtspError> {
    for (name, value) in message.iter() {
        encode_field(name, value, dst)?;
    }
    Ok(())
}

fn encode_field(name: &str, value: &HtspValue, dst: &mut BytesMut) -> Result<(), HtspError> {
    if name.len() > u8::MAX as usize {
        return Err(HtspError::Malformed("field name exceeds 255 bytes"));
    }

    let (ftype, data) = encode_value(value)?;
    if data.len() > u32::MAX as usize {
        return Err(HtspError::Malformed("field data exceeds u32 length"));
    }

    dst.put_u8(ftype);
    dst.put_u8(name.len() as u8);
    dst.put_u32(data.len() as u32);
    dst.extend_from_slice(name.as_bytes());
    dst.extend_from_slice(&data);
    Ok(())
}

fn encode_value(value: &HtspValue) -> Result<(u8, BytesMut), HtspError> {
    let mut data = BytesMut::new();
    let ftype = match value {
        HtspValue::Map(map) => {
            encode_fields(map, &mut data)?;
            TYPE_MAP
        }
        HtspValue::S64(v) => {
            encode_s64(*v, &mut data);
            TYPE_S64
        }
        HtspValue::Str(bytes) => {
            data.extend_from_slice(bytes);
            TYPE_STR
        }
        HtspValue::Bin(bytes) => {
            data.extend_from_slice(bytes);
            TYPE_BIN
        }
        HtspValue::List(values) => {
            for value in values {
                // List entries carry an empty name.
                encode_field("", value, &mut data)?;
            }
            TYPE_LIST
        }
    };
    Ok((ftype, data))
}

/// Minimum-length big-endian two's-complement encoding. Leading bytes
/// are dropped while sign extension still reconstructs the value;
/// zero encodes as zero bytes.
fn encode_s64(value: i64, dst: &mut BytesMut) {
    if value == 0 {
        return;
    }
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] < 0x80)
            || (bytes[start] == 0xFF && bytes[start + 1] >= 0x80);
        if !redundant {
            break;
        }
        start += 1;
    }
    dst.extend_from_slice(&bytes[start..]);
}

// ── Parser ───────────────────────────────────────────────────────

/// Parse one frame body (the bytes after the length prefix).
pub fn decode_body(mut body: Bytes) -> Result<HtspMessage, HtspError> {
    parse_fields(&mut body)
}

fn parse_fields(buf: &mut Bytes) -> Result<HtspMessage, HtspError> {
    let mut message = HtspMessage::new();
    while !buf.is_empty() {
        let (name, value) = parse_field(buf)?;
        message.put(&name, value);
    }
    Ok(message)
}

fn parse_list(buf: &mut Bytes) -> Result<Vec<HtspValue>, HtspError> {
    let mut values = Vec::new();
    while !buf.is_empty() {
        let (_, value) = parse_field(buf)?;
        values.push(value);
    }
    Ok(values)
}

fn parse_field(buf: &mut Bytes) -> Result<(String, HtspValue), HtspError> {
    if buf.len() < FIELD_HEADER_LEN {
        return Err(HtspError::Malformed("truncated field header"));
    }

    let ftype = buf[0];
    let namelen = buf[1] as usize;
    let datalen = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    buf.advance(FIELD_HEADER_LEN);

    if buf.len() < namelen + datalen {
        return Err(HtspError::Malformed("field length exceeds container"));
    }

    let name_bytes = buf.split_to(namelen);
    let name = std::str::from_utf8(&name_bytes)
        .map_err(|_| HtspError::Malformed("field name is not utf-8"))?
        .to_owned();
    let mut data = buf.split_to(datalen);

    let value = match ftype {
        TYPE_MAP => HtspValue::Map(parse_fields(&mut data)?),
        TYPE_S64 => HtspValue::S64(decode_s64(&data)?),
        TYPE_STR => HtspValue::Str(data),
        TYPE_BIN => HtspValue::Bin(data),
        TYPE_LIST => HtspValue::List(parse_list(&mut data)?),
        _ => return Err(HtspError::Malformed("type byte out of range")),
    };

    Ok((name, value))
}

fn decode_s64(data: &[u8]) -> Result<i64, HtspError> {
    if data.len() > 8 {
        return Err(HtspError::Malformed("integer wider than 64 bits"));
    }
    if data.is_empty() {
        return Ok(0);
    }
    // Seed with the sign so shorter encodings extend correctly.
    let mut value: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in data {
        value = (value << 8) | i64::from(byte);
    }
    Ok(value)
}

// ── Codec ────────────────────────────────────────────────────────

/// Framing codec for use with `tokio_util::codec::Framed`.
///
/// Decoding is incremental: partial frames yield `Ok(None)` and the
/// bytes stay buffered until the frame completes.
#[derive(Debug, Default)]
pub struct HtspCodec;

impl HtspCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for HtspCodec {
    type Item = HtspMessage;
    type Error = HtspError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(HtspError::Malformed("frame exceeds size limit"));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(length).freeze();
        decode_body(body).map(Some)
    }
}

impl Encoder<HtspMessage> for HtspCodec {
    type Error = HtspError;

    fn encode(&mut self, item: HtspMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = encode_frame(&item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
