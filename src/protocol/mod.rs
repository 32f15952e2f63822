// soulseek-core - Network and concurrency substrate for a Soulseek peer-to-peer client
// Copyright (C) 2024  soulseek-core contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Binary framed message codec.
//!
//! A frame is `u32 length (LE) || body`, where `body`'s own leading `u32`
//! is the message code. All integers are little-endian; strings are
//! `u32 length + UTF-8 bytes`; IP addresses are transmitted as `u32` with
//! reversed byte order (a protocol quirk, not a generic endianness issue).
//!
//! Decoding parses with `nom` combinators over a byte slice; encoding
//! writes directly into a `BytesMut` with `bytes::BufMut`.

pub mod distributed;
pub mod peer;
pub mod server;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nom::bytes::complete::take;
use nom::number::complete::{le_u32, le_u64, le_u8};
use nom::IResult;
use std::net::Ipv4Addr;

use crate::error::{SlskError, SlskResult};

/// Which of the four disjoint code spaces a message code belongs to.
/// Code values overlap across scopes; the caller must pick the scope
/// before interpreting a decoded code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Server,
    Peer,
    Distributed,
    Transfer,
}

/// Encode a complete frame: `u32 len || u32 code || body`, where `len`
/// counts everything after itself (the code plus the body).
pub fn encode_frame(code: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_u32_le((4 + body.len()) as u32);
    buf.put_u32_le(code);
    buf.put_slice(body);
    buf.freeze()
}

/// Split a complete frame (length prefix already stripped by the caller's
/// transport framing) into its message code and body. Fails with
/// `MalformedMessage` if the buffer is too short to even hold a code.
pub fn decode_frame(frame: &[u8]) -> SlskResult<(u32, &[u8])> {
    let (rest, code) = le_u32::<_, nom::error::Error<&[u8]>>(frame)
        .map_err(|_| SlskError::MalformedMessage)?;
    Ok((code, rest))
}

/// Validate a raw `length || body` buffer read straight off the socket:
/// `length` must equal `body.len()` exactly (it is the total frame size
/// minus the 4 bytes of the length prefix itself).
pub fn check_length_prefix(declared_len: u32, body_len: usize) -> SlskResult<()> {
    if declared_len as usize != body_len {
        return Err(SlskError::MalformedMessage);
    }
    Ok(())
}

pub(crate) fn parse_u8(input: &[u8]) -> IResult<&[u8], u8> {
    le_u8(input)
}

pub(crate) fn parse_u32(input: &[u8]) -> IResult<&[u8], u32> {
    le_u32(input)
}

pub(crate) fn parse_u64(input: &[u8]) -> IResult<&[u8], u64> {
    le_u64(input)
}

pub(crate) fn parse_i32(input: &[u8]) -> IResult<&[u8], i32> {
    nom::number::complete::le_i32(input)
}

pub(crate) fn parse_bool(input: &[u8]) -> IResult<&[u8], bool> {
    let (rest, v) = le_u8(input)?;
    Ok((rest, v != 0))
}

pub(crate) fn parse_string(input: &[u8]) -> IResult<&[u8], String> {
    let (rest, len) = le_u32(input)?;
    let (rest, bytes) = take(len as usize)(rest)?;
    let s = String::from_utf8_lossy(bytes).into_owned();
    Ok((rest, s))
}

/// IP addresses are transmitted as a little-endian `u32` whose byte order
/// is additionally reversed relative to the address's natural octets.
pub(crate) fn parse_ip(input: &[u8]) -> IResult<&[u8], Ipv4Addr> {
    let (rest, raw) = le_u32(input)?;
    let octets = raw.to_le_bytes();
    Ok((
        rest,
        Ipv4Addr::new(octets[3], octets[2], octets[1], octets[0]),
    ))
}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn put_ip(buf: &mut BytesMut, ip: Ipv4Addr) {
    let octets = ip.octets();
    buf.put_u32_le(u32::from_le_bytes([
        octets[3], octets[2], octets[1], octets[0],
    ]));
}

/// Attribute pair attached to a shared-file record (e.g. bitrate,
/// duration); `kind` and `value` are protocol-defined small integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u32,
    pub value: u32,
}

/// A single shared-file record as used by browse/search responses:
/// `code(u8) || filename(string) || size(u64) || ext(string) || attributes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub code: u8,
    pub filename: String,
    pub size: u64,
    pub extension: String,
    pub attributes: Vec<Attribute>,
}

impl FileEntry {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code);
        put_string(buf, &self.filename);
        buf.put_u64_le(self.size);
        put_string(buf, &self.extension);
        buf.put_u32_le(self.attributes.len() as u32);
        for attr in &self.attributes {
            buf.put_u32_le(attr.kind);
            buf.put_u32_le(attr.value);
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], FileEntry> {
        let (input, code) = parse_u8(input)?;
        let (input, filename) = parse_string(input)?;
        let (input, size) = parse_u64(input)?;
        let (input, extension) = parse_string(input)?;
        let (input, attr_count) = parse_u32(input)?;
        let (input, attributes) = nom::multi::count(
            nom::combinator::map(
                nom::sequence::pair(parse_u32, parse_u32),
                |(kind, value)| Attribute { kind, value },
            ),
            attr_count as usize,
        )(input)?;
        Ok((
            input,
            FileEntry {
                code,
                filename,
                size,
                extension,
                attributes,
            },
        ))
    }
}

/// Cursor-style reader over a decoded message body, used by message
/// structs that parse with `bytes::Buf` instead of `nom` (kept for the
/// handful of messages that are simpler read sequentially than declared
/// as a combinator grammar).
pub(crate) struct BodyReader<'a> {
    remaining: &'a [u8],
}

impl<'a> BodyReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { remaining: body }
    }

    pub fn read_u32(&mut self) -> SlskResult<u32> {
        if self.remaining.remaining() < 4 {
            return Err(SlskError::MalformedMessage);
        }
        Ok(self.remaining.get_u32_le())
    }

    pub fn read_i32(&mut self) -> SlskResult<i32> {
        if self.remaining.remaining() < 4 {
            return Err(SlskError::MalformedMessage);
        }
        Ok(self.remaining.get_i32_le())
    }

    pub fn read_string(&mut self) -> SlskResult<String> {
        let len = self.read_u32()? as usize;
        if self.remaining.remaining() < len {
            return Err(SlskError::MalformedMessage);
        }
        let bytes = &self.remaining[..len];
        self.remaining.advance(len);
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_encode_decode_round_trip() {
        let frame = encode_frame(42, b"hello");
        // Strip the length prefix the way a transport-level reader would.
        let declared_len = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        let body = &frame[4..];
        check_length_prefix(declared_len, body.len()).unwrap();

        let (code, rest) = decode_frame(body).unwrap();
        assert_eq!(code, 42);
        assert_eq!(rest, b"hello");
    }

    #[test]
    fn truncated_frame_is_malformed() {
        // A 2-byte body cannot even hold a u32 code.
        let result = decode_frame(&[0x01, 0x02]);
        assert!(matches!(result, Err(SlskError::MalformedMessage)));
    }

    #[test]
    fn length_prefix_mismatch_is_malformed() {
        let result = check_length_prefix(10, 5);
        assert!(matches!(result, Err(SlskError::MalformedMessage)));
    }

    #[test]
    fn ip_byte_order_is_reversed_on_the_wire() {
        let mut buf = BytesMut::new();
        let ip = Ipv4Addr::new(192, 168, 1, 2);
        put_ip(&mut buf, ip);
        let (_, parsed) = parse_ip(&buf).unwrap();
        assert_eq!(parsed, ip);

        // Confirm it really is reversed, not just consistent with itself.
        let raw = u32::from_le_bytes(buf[..4].try_into().unwrap());
        assert_eq!(raw.to_le_bytes(), [2, 1, 168, 192]);
    }

    #[test]
    fn file_entry_round_trips() {
        let entry = FileEntry {
            code: 1,
            filename: "song.flac".into(),
            size: 123_456,
            extension: "flac".into(),
            attributes: vec![Attribute { kind: 0, value: 320 }],
        };
        let mut buf = BytesMut::new();
        entry.write(&mut buf);

        let (rest, parsed) = FileEntry::parse(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, entry);
    }

    proptest::proptest! {
        #[test]
        fn frame_round_trip_any_code_and_body(code: u32, body in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64)) {
            let frame = encode_frame(code, &body);
            let declared_len = u32::from_le_bytes(frame[0..4].try_into().unwrap());
            let rest = &frame[4..];
            check_length_prefix(declared_len, rest.len()).unwrap();
            let (decoded_code, decoded_body) = decode_frame(rest).unwrap();
            assert_eq!(decoded_code, code);
            assert_eq!(decoded_body, &body[..]);
        }
    }
}
