//! Binary packet encoder and streaming response parser
//!
//! Every packet is a fixed 24-byte header followed by
//! `extras ‖ key ‖ value`, all lengths big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::opcode::{Opcode, Status, REQUEST_MAGIC, RESPONSE_MAGIC};
use crate::error::{KvError, Result};

/// Size of the fixed packet header
pub const HEADER_LEN: usize = 24;

/// Largest body accepted from a server (20MB document + headroom)
pub const MAX_BODY_LEN: usize = 21 * 1024 * 1024;

/// An outgoing request packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub datatype: u8,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Request {
    /// Create an empty request for `opcode`
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            datatype: 0,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = vbucket;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }
}

/// A decoded response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Raw opcode byte echoed by the server
    pub opcode: u8,
    pub datatype: u8,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

/// Encode a request into the buffer
pub fn encode_request(req: &Request, buf: &mut BytesMut) -> Result<()> {
    let key_len = u16::try_from(req.key.len())
        .map_err(|_| KvError::InvalidArgument(format!("key of {} bytes", req.key.len())))?;
    let extras_len = u8::try_from(req.extras.len())
        .map_err(|_| KvError::InvalidArgument(format!("{} bytes of extras", req.extras.len())))?;
    let body_len = req.extras.len() + req.key.len() + req.value.len();
    let body_len = u32::try_from(body_len)
        .map_err(|_| KvError::InvalidArgument(format!("body of {} bytes", body_len)))?;

    buf.reserve(HEADER_LEN + body_len as usize);
    buf.put_u8(REQUEST_MAGIC);
    buf.put_u8(req.opcode as u8);
    buf.put_u16(key_len);
    buf.put_u8(extras_len);
    buf.put_u8(req.datatype);
    buf.put_u16(req.vbucket);
    buf.put_u32(body_len);
    buf.put_u32(req.opaque);
    buf.put_u64(req.cas);
    buf.put_slice(&req.extras);
    buf.put_slice(&req.key);
    buf.put_slice(&req.value);
    Ok(())
}

/// Parse one response from the front of the buffer
///
/// Returns `Ok(None)` until a complete packet is buffered. Consumed bytes
/// are split off; trailing bytes stay in `buf`.
pub fn parse_response(buf: &mut BytesMut) -> Result<Option<Response>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let header = &buf[..HEADER_LEN];
    if header[0] != RESPONSE_MAGIC {
        return Err(KvError::Protocol(format!(
            "unexpected magic: {:02x}",
            header[0]
        )));
    }
    let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let extras_len = header[4] as usize;
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;

    if body_len > MAX_BODY_LEN {
        return Err(KvError::Protocol(format!(
            "body size {} exceeds limit {}",
            body_len, MAX_BODY_LEN
        )));
    }
    if key_len + extras_len > body_len {
        return Err(KvError::Protocol(format!(
            "key ({}) and extras ({}) overflow body ({})",
            key_len, extras_len, body_len
        )));
    }
    if buf.len() < HEADER_LEN + body_len {
        return Ok(None);
    }

    let mut packet = buf.split_to(HEADER_LEN + body_len).freeze();
    packet.advance(1);
    let opcode = packet.get_u8();
    packet.advance(3);
    let datatype = packet.get_u8();
    let status = Status(packet.get_u16());
    packet.advance(4);
    let opaque = packet.get_u32();
    let cas = packet.get_u64();
    let extras = packet.split_to(extras_len);
    let key = packet.split_to(key_len);

    Ok(Some(Response {
        opcode,
        datatype,
        status,
        opaque,
        cas,
        extras,
        key,
        value: packet,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_bytes(status: u16, extras: &[u8], key: &[u8], value: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(RESPONSE_MAGIC);
        buf.put_u8(Opcode::Get as u8);
        buf.put_u16(key.len() as u16);
        buf.put_u8(extras.len() as u8);
        buf.put_u8(1);
        buf.put_u16(status);
        buf.put_u32((extras.len() + key.len() + value.len()) as u32);
        buf.put_u32(7);
        buf.put_u64(0xdead_beef);
        buf.put_slice(extras);
        buf.put_slice(key);
        buf.put_slice(value);
        buf
    }

    #[test]
    fn test_encode_add_request_layout() {
        let req = Request::new(Opcode::Add)
            .with_key(&b"foo"[..])
            .with_extras(vec![0, 0, 0, 9, 0, 0, 0, 0])
            .with_value(&b"{}"[..])
            .with_vbucket(115)
            .with_datatype(1);
        let mut buf = BytesMut::new();
        encode_request(&req, &mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_LEN + 8 + 3 + 2);
        assert_eq!(buf[0], REQUEST_MAGIC);
        assert_eq!(buf[1], 0x02);
        assert_eq!(&buf[2..4], &[0, 3]);
        assert_eq!(buf[4], 8);
        assert_eq!(buf[5], 1);
        assert_eq!(&buf[6..8], &115u16.to_be_bytes());
        assert_eq!(&buf[8..12], &13u32.to_be_bytes());
        assert_eq!(&buf[HEADER_LEN + 8..HEADER_LEN + 11], b"foo");
    }

    #[test]
    fn test_encode_rejects_oversized_key() {
        let req = Request::new(Opcode::Get).with_key(vec![b'k'; 70_000]);
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_request(&req, &mut buf),
            Err(KvError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_parse_complete_response() {
        let mut buf = response_bytes(0, &[0, 0, 0, 5], b"", b"{\"a\":1}");
        let resp = parse_response(&mut buf).unwrap().unwrap();
        assert_eq!(resp.status, Status::SUCCESS);
        assert_eq!(resp.opaque, 7);
        assert_eq!(resp.cas, 0xdead_beef);
        assert_eq!(&resp.extras[..], &[0, 0, 0, 5]);
        assert_eq!(&resp.value[..], b"{\"a\":1}");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_incomplete_waits() {
        let full = response_bytes(1, &[], b"", b"Not found");
        let mut partial = BytesMut::from(&full[..HEADER_LEN + 3]);
        assert!(parse_response(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), HEADER_LEN + 3);

        let mut short_header = BytesMut::from(&full[..10]);
        assert!(parse_response(&mut short_header).unwrap().is_none());
    }

    #[test]
    fn test_parse_leaves_trailing_packet() {
        let mut buf = response_bytes(0, &[], b"", b"one");
        buf.extend_from_slice(&response_bytes(1, &[], b"", b"two"));
        let first = parse_response(&mut buf).unwrap().unwrap();
        assert_eq!(&first.value[..], b"one");
        let second = parse_response(&mut buf).unwrap().unwrap();
        assert_eq!(second.status, Status::KEY_NOT_FOUND);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_bad_magic() {
        let mut buf = response_bytes(0, &[], b"", b"");
        buf[0] = REQUEST_MAGIC;
        assert!(matches!(parse_response(&mut buf), Err(KvError::Protocol(_))));
    }

    #[test]
    fn test_parse_inconsistent_lengths() {
        let mut buf = response_bytes(0, &[0, 0, 0, 0], b"", b"");
        buf[2] = 0;
        buf[3] = 9;
        assert!(matches!(parse_response(&mut buf), Err(KvError::Protocol(_))));
    }
}
