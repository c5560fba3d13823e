//! Wire framing
//!
//! Messages are a type byte followed by a big-endian `u32` length that
//! counts itself and the body. The very first packet of a connection is a
//! startup packet: length, protocol version, then `key\0value\0` pairs
//! closed by an empty key.

use std::collections::HashMap;
use std::io::{self, Read};

use super::errors::{ReplicationError, ReplicationResult};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Type oid for text columns.
pub const TEXT_OID: i32 = 25;
/// Type oid for int4 columns.
pub const INT4_OID: i32 = 23;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(tag: u8, body: Vec<u8>) -> Self {
        Self { tag, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.body.len());
        out.push(self.tag);
        out.extend_from_slice(&((self.body.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Payload of a `'d'` CopyData frame.
    pub fn copy_payload(&self) -> Option<&[u8]> {
        (self.tag == b'd').then_some(self.body.as_slice())
    }

    /// Text of a `'Q'` query frame, without the terminator.
    pub fn query_text(&self) -> ReplicationResult<String> {
        let mut reader = MessageReader::new(&self.body);
        reader.get_cstr()
    }
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut tag = [0u8; 1];
    match reader.read_exact(&mut tag) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if !(4..=MAX_FRAME_LEN).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid message length {}", len),
        ));
    }
    let mut body = vec![0u8; len - 4];
    reader.read_exact(&mut body)?;
    Ok(Some(Frame::new(tag[0], body)))
}

/// A read timeout on the socket surfaces as WouldBlock or TimedOut
/// depending on the platform.
fn startup_read_error(context: &str, err: &io::Error) -> ReplicationError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            ReplicationError::timeout("timeout expired while reading startup packet")
        }
        _ => ReplicationError::io(context, err),
    }
}

/// Startup packet sent by the peer before any framed message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupPacket {
    pub protocol_version: u32,
    pub params: HashMap<String, String>,
}

impl StartupPacket {
    pub fn new(protocol_version: u32) -> Self {
        Self {
            protocol_version,
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = MessageBuilder::new();
        body.put_u32(self.protocol_version);
        let mut keys: Vec<&String> = self.params.keys().collect();
        keys.sort();
        for key in keys {
            body.put_cstr(key);
            body.put_cstr(&self.params[key]);
        }
        body.put_u8(0);
        let body = body.finish();
        let mut out = Vec::with_capacity(body.len() + 4);
        out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn read<R: Read>(reader: &mut R) -> ReplicationResult<Self> {
        let mut len = [0u8; 4];
        reader
            .read_exact(&mut len)
            .map_err(|e| startup_read_error("could not read startup packet", &e))?;
        let len = u32::from_be_bytes(len) as usize;
        if !(8..=10_000).contains(&len) {
            return Err(ReplicationError::protocol_violation(format!(
                "invalid length of startup packet: {}",
                len
            )));
        }
        let mut body = vec![0u8; len - 4];
        reader
            .read_exact(&mut body)
            .map_err(|e| startup_read_error("incomplete startup packet", &e))?;
        Self::decode(&body)
    }

    pub fn decode(body: &[u8]) -> ReplicationResult<Self> {
        let mut r = MessageReader::new(body);
        let protocol_version = r.get_u32()?;
        let mut params = HashMap::new();
        loop {
            let key = r.get_cstr()?;
            if key.is_empty() {
                break;
            }
            let value = r.get_cstr()?;
            params.insert(key, value);
        }
        Ok(Self {
            protocol_version,
            params,
        })
    }
}

/// Big-endian body writer.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.put_u8(v as u8)
    }

    pub fn put_i16(&mut self, v: i16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_cstr(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Big-endian body reader. Short input is a protocol violation.
#[derive(Debug)]
pub struct MessageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> ReplicationResult<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(ReplicationError::protocol_violation(format!(
                "message too short: wanted {} more bytes at offset {}",
                n, self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> ReplicationResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> ReplicationResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> ReplicationResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_i16(&mut self) -> ReplicationResult<i16> {
        Ok(i16::from_be_bytes(self.array()?))
    }

    pub fn get_i32(&mut self) -> ReplicationResult<i32> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub fn get_u32(&mut self) -> ReplicationResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn get_i64(&mut self) -> ReplicationResult<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub fn get_u64(&mut self) -> ReplicationResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn get_cstr(&mut self) -> ReplicationResult<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            ReplicationError::protocol_violation("unterminated string in message")
        })?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| ReplicationError::protocol_violation("invalid UTF-8 in message"))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// A column of a result row description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub type_oid: i32,
}

impl Column {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            type_oid: TEXT_OID,
        }
    }

    pub const fn int4(name: &'static str) -> Self {
        Self {
            name,
            type_oid: INT4_OID,
        }
    }
}

pub fn row_description(columns: &[Column]) -> Frame {
    let mut b = MessageBuilder::new();
    b.put_i16(columns.len() as i16);
    for col in columns {
        b.put_cstr(col.name)
            .put_i32(0)
            .put_i16(0)
            .put_i32(col.type_oid)
            .put_i16(-1)
            .put_i32(0)
            .put_i16(0);
    }
    Frame::new(b'T', b.finish())
}

pub fn data_row(values: &[Option<String>]) -> Frame {
    let mut b = MessageBuilder::new();
    b.put_i16(values.len() as i16);
    for value in values {
        match value {
            Some(v) => {
                b.put_i32(v.len() as i32).put_bytes(v.as_bytes());
            }
            None => {
                b.put_i32(-1);
            }
        }
    }
    Frame::new(b'D', b.finish())
}

pub fn command_complete(tag: &str) -> Frame {
    let mut b = MessageBuilder::new();
    b.put_cstr(tag);
    Frame::new(b'C', b.finish())
}

pub fn ready_for_query() -> Frame {
    Frame::new(b'Z', vec![b'I'])
}

/// Enter copy-both mode: text format, no columns.
pub fn copy_both_response() -> Frame {
    let mut b = MessageBuilder::new();
    b.put_u8(0).put_i16(0);
    Frame::new(b'W', b.finish())
}

pub fn copy_data(payload: Vec<u8>) -> Frame {
    Frame::new(b'd', payload)
}

pub fn copy_done() -> Frame {
    Frame::new(b'c', Vec::new())
}

pub fn error_response(sqlstate: &str, message: &str) -> Frame {
    let mut b = MessageBuilder::new();
    b.put_u8(b'S').put_cstr("ERROR");
    b.put_u8(b'C').put_cstr(sqlstate);
    b.put_u8(b'M').put_cstr(message);
    b.put_u8(0);
    Frame::new(b'E', b.finish())
}

pub fn query(text: &str) -> Frame {
    let mut b = MessageBuilder::new();
    b.put_cstr(text);
    Frame::new(b'Q', b.finish())
}

pub fn terminate() -> Frame {
    Frame::new(b'X', Vec::new())
}

/// Decoded DataRow, for peers and tests.
pub fn parse_data_row(frame: &Frame) -> ReplicationResult<Vec<Option<String>>> {
    if frame.tag != b'D' {
        return Err(ReplicationError::protocol_violation(format!(
            "expected DataRow, got '{}'",
            frame.tag as char
        )));
    }
    let mut r = MessageReader::new(&frame.body);
    let n = r.get_i16()?;
    let mut out = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
        let len = r.get_i32()?;
        if len < 0 {
            out.push(None);
        } else {
            let bytes = r.take(len as usize)?;
            out.push(Some(String::from_utf8_lossy(bytes).into_owned()));
        }
    }
    Ok(out)
}

/// Column names of a RowDescription, for peers and tests.
pub fn parse_row_description(frame: &Frame) -> ReplicationResult<Vec<String>> {
    if frame.tag != b'T' {
        return Err(ReplicationError::protocol_violation(format!(
            "expected RowDescription, got '{}'",
            frame.tag as char
        )));
    }
    let mut r = MessageReader::new(&frame.body);
    let n = r.get_i16()?;
    let mut names = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
        names.push(r.get_cstr()?);
        r.take(18)?;
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::errors::ReplicationErrorKind;

    #[test]
    fn test_frame_encoding_includes_length() {
        let bytes = Frame::new(b'Q', b"x\0".to_vec()).encode();
        assert_eq!(bytes, vec![b'Q', 0, 0, 0, 6, b'x', 0]);
    }

    struct StalledReader;

    impl Read for StalledReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    #[test]
    fn test_stalled_startup_read_is_timeout() {
        let err = StartupPacket::read(&mut StalledReader).unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::Timeout);
        assert!(err.message.contains("startup packet"));
    }

    #[test]
    fn test_read_frame_and_clean_eof() {
        let mut input = Vec::new();
        input.extend(query("IDENTIFY_SYSTEM").encode());
        let mut cursor = io::Cursor::new(input);

        let frame = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(frame.query_text().unwrap(), "IDENTIFY_SYSTEM");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_read_frame_rejects_bad_length() {
        let mut cursor = io::Cursor::new(vec![b'Q', 0, 0, 0, 2]);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_startup_packet_parameters() {
        let packet = StartupPacket::new(3)
            .with_param("replication", "true")
            .with_param("application_name", "east");
        let bytes = packet.encode();
        let decoded = StartupPacket::read(&mut io::Cursor::new(bytes)).unwrap();
        assert_eq!(decoded.protocol_version, 3);
        assert_eq!(decoded.param("application_name"), Some("east"));
    }

    #[test]
    fn test_data_row_with_null() {
        let frame = data_row(&[Some("abc".into()), None]);
        assert_eq!(parse_data_row(&frame).unwrap(), vec![Some("abc".into()), None]);
    }

    #[test]
    fn test_row_description_names() {
        let frame = row_description(&[Column::text("systemid"), Column::int4("timeline")]);
        assert_eq!(
            parse_row_description(&frame).unwrap(),
            vec!["systemid".to_string(), "timeline".to_string()]
        );
    }

    #[test]
    fn test_short_message_is_protocol_violation() {
        let mut r = MessageReader::new(&[0, 1]);
        let err = r.get_i32().unwrap_err();
        assert_eq!(
            err.kind,
            crate::replication::ReplicationErrorKind::ProtocolViolation
        );
    }
}
