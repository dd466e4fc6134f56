//! RESP2 frame representation and the `tokio_util` codec that (de)serializes it.
//!
//! Sentinel is both a client of the instances it monitors and a limited
//! server to its own callers, so it needs the wire format in both
//! directions. Only the RESP2 subset is implemented: Sentinel's command
//! surface (`spec.md` §6) never needs RESP3 maps, sets, or doubles.

use crate::error::SentinelError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

/// Caps chosen to match the scale of Sentinel's own traffic (small commands,
/// small INFO replies), not the storage engine's bulk payloads.
const MAX_FRAME_ELEMENTS: usize = 64 * 1024;
const MAX_BULK_STRING_SIZE: usize = 16 * 1024 * 1024;

/// A single RESP2 frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    pub fn bulk(s: impl Into<Vec<u8>>) -> Self {
        RespFrame::BulkString(Bytes::from(s.into()))
    }

    pub fn array_of_bulks<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        RespFrame::Array(items.into_iter().map(RespFrame::bulk).collect())
    }

    /// Encodes this frame into a freshly allocated buffer.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, SentinelError> {
        let mut buf = BytesMut::new();
        RespFrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Returns the bulk-string payload as a UTF-8 (lossy) string, if this frame is one.
    pub fn as_str_lossy(&self) -> Option<std::borrow::Cow<'_, str>> {
        match self {
            RespFrame::BulkString(b) => Some(String::from_utf8_lossy(b)),
            RespFrame::SimpleString(s) => Some(std::borrow::Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }
}

/// A `tokio_util::codec` implementation for `RespFrame`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = SentinelError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
            RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
            RespFrame::Array(arr) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = SentinelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_frame(src) {
            Ok((frame, len)) => {
                src.advance(len);
                Ok(Some(frame))
            }
            Err(SentinelError::IncompleteFrame) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn parse_frame(src: &[u8]) -> Result<(RespFrame, usize), SentinelError> {
    if src.is_empty() {
        return Err(SentinelError::IncompleteFrame);
    }
    match src[0] {
        b'+' => parse_simple_string(src),
        b'-' => parse_error(src),
        b':' => parse_integer(src),
        b'$' => parse_bulk_string(src),
        b'*' => parse_array(src),
        _ => Err(SentinelError::Protocol("unknown frame type prefix".into())),
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|w| w == CRLF)
}

fn parse_line(src: &[u8]) -> Result<(&[u8], usize), SentinelError> {
    find_crlf(src)
        .map(|pos| (&src[..pos], pos + CRLF_LEN))
        .ok_or(SentinelError::IncompleteFrame)
}

fn parse_simple_string(src: &[u8]) -> Result<(RespFrame, usize), SentinelError> {
    let (line, len) = parse_line(&src[1..])?;
    Ok((
        RespFrame::SimpleString(String::from_utf8_lossy(line).into_owned()),
        len + 1,
    ))
}

fn parse_error(src: &[u8]) -> Result<(RespFrame, usize), SentinelError> {
    let (line, len) = parse_line(&src[1..])?;
    Ok((
        RespFrame::Error(String::from_utf8_lossy(line).into_owned()),
        len + 1,
    ))
}

fn parse_integer(src: &[u8]) -> Result<(RespFrame, usize), SentinelError> {
    let (line, len) = parse_line(&src[1..])?;
    let s = String::from_utf8_lossy(line);
    let i = s
        .parse::<i64>()
        .map_err(|_| SentinelError::Protocol("invalid integer frame".into()))?;
    Ok((RespFrame::Integer(i), len + 1))
}

fn parse_bulk_string(src: &[u8]) -> Result<(RespFrame, usize), SentinelError> {
    let (line, len_of_line) = parse_line(&src[1..])?;
    let s = String::from_utf8_lossy(line);
    let str_len = s
        .parse::<isize>()
        .map_err(|_| SentinelError::Protocol("invalid bulk string length".into()))?;

    if str_len == -1 {
        return Ok((RespFrame::Null, len_of_line + 1));
    }
    let str_len = str_len as usize;
    if str_len > MAX_BULK_STRING_SIZE {
        return Err(SentinelError::Protocol("bulk string too large".into()));
    }

    let prefix_len = len_of_line + 1;
    if src.len() < prefix_len + str_len + CRLF_LEN {
        return Err(SentinelError::IncompleteFrame);
    }
    if &src[prefix_len + str_len..prefix_len + str_len + CRLF_LEN] != CRLF {
        return Err(SentinelError::Protocol("missing bulk string terminator".into()));
    }

    let data = Bytes::copy_from_slice(&src[prefix_len..prefix_len + str_len]);
    Ok((RespFrame::BulkString(data), prefix_len + str_len + CRLF_LEN))
}

fn parse_array(src: &[u8]) -> Result<(RespFrame, usize), SentinelError> {
    let (line, len_of_line) = parse_line(&src[1..])?;
    let s = String::from_utf8_lossy(line);
    let arr_len = s
        .parse::<isize>()
        .map_err(|_| SentinelError::Protocol("invalid array length".into()))?;

    if arr_len == -1 {
        return Ok((RespFrame::NullArray, len_of_line + 1));
    }
    let arr_len = arr_len as usize;
    if arr_len > MAX_FRAME_ELEMENTS {
        return Err(SentinelError::Protocol("array too large".into()));
    }

    let mut frames = Vec::with_capacity(arr_len);
    let mut cursor = len_of_line + 1;
    for _ in 0..arr_len {
        let (frame, frame_len) = parse_frame(&src[cursor..])?;
        frames.push(frame);
        cursor += frame_len;
    }
    Ok((RespFrame::Array(frames), cursor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: RespFrame) {
        let mut buf = BytesMut::new();
        RespFrameCodec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = RespFrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrips_all_variants() {
        roundtrip(RespFrame::SimpleString("PONG".into()));
        roundtrip(RespFrame::Error("ERR nope".into()));
        roundtrip(RespFrame::Integer(-42));
        roundtrip(RespFrame::bulk("hello"));
        roundtrip(RespFrame::Null);
        roundtrip(RespFrame::NullArray);
        roundtrip(RespFrame::array_of_bulks(["PING"]));
    }

    #[test]
    fn decode_waits_for_more_data_on_partial_frame() {
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        assert!(RespFrameCodec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lo\r\n");
        let frame = RespFrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, RespFrame::bulk("hello"));
    }

    #[test]
    fn nested_arrays_parse_in_order() {
        let cmd = RespFrame::array_of_bulks(["SENTINEL", "GET-MASTER-ADDR-BY-NAME", "mymaster"]);
        roundtrip(cmd);
    }
}
