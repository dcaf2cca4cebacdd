//! Length-framed binary datagrams with a typed write surface and a
//! truncation-checked read cursor.
//!
//! All integers are little-endian, including the u16 length prefixes used
//! for strings, blobs, and client frames. A datagram never exceeds
//! [`DATAGRAM_MAX_SIZE`] on the wire; writers that could cross that limit
//! are checked where the datagram is routed.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use gate_core::dclass::{DcField, FieldType};
use gate_core::Channel;

/// Largest datagram representable behind a u16 length prefix.
pub const DATAGRAM_MAX_SIZE: usize = 65535;

/// Errors raised by the wire layer.
#[derive(Debug, Clone, Error)]
pub enum WireError {
    /// A read ran past the end of the datagram.
    #[error("datagram truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A string or blob was too long for its u16 length prefix.
    #[error("value too long for u16 length prefix: {0} bytes")]
    LengthOverflow(usize),

    /// A frame exceeded the maximum datagram size.
    #[error("frame exceeds maximum datagram size: {0} bytes")]
    Oversized(usize),

    /// Transport-level failure while framing.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Growable binary buffer with typed appenders.
#[derive(Debug, Clone, Default)]
pub struct Datagram {
    buf: BytesMut,
}

impl Datagram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a server-bound datagram with a single-recipient envelope.
    pub fn with_server_header(recipient: Channel, sender: Channel, msgtype: u16) -> Self {
        let mut dg = Self::new();
        dg.add_server_header(recipient, sender, msgtype);
        dg
    }

    /// Starts a client-bound frame body with its message type.
    pub fn with_msgtype(msgtype: u16) -> Self {
        let mut dg = Self::new();
        dg.add_u16(msgtype);
        dg
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn add_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    /// Appends a u16-length-prefixed string.
    pub fn add_string(&mut self, s: &str) -> Result<(), WireError> {
        self.add_blob(s.as_bytes())
    }

    /// Appends u16-length-prefixed bytes.
    pub fn add_blob(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len =
            u16::try_from(bytes.len()).map_err(|_| WireError::LengthOverflow(bytes.len()))?;
        self.buf.put_u16_le(len);
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Appends raw bytes with no length prefix.
    pub fn add_data(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Writes the message director envelope: one recipient, the sender, and
    /// the message type.
    pub fn add_server_header(&mut self, recipient: Channel, sender: Channel, msgtype: u16) {
        self.add_u8(1);
        self.add_u64(recipient);
        self.add_u64(sender);
        self.add_u16(msgtype);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Read cursor over a received datagram.
///
/// Every read checks the remaining length first and fails with
/// [`WireError::Truncated`] instead of running off the end.
#[derive(Debug, Clone)]
pub struct DatagramIter {
    data: Bytes,
    offset: usize,
}

impl DatagramIter {
    pub fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, n: usize) -> Result<&[u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads u16-length-prefixed bytes.
    pub fn read_blob(&mut self) -> Result<Bytes, WireError> {
        let len = usize::from(self.read_u16()?);
        self.read_data(len)
    }

    /// Reads a u16-length-prefixed string. Non-UTF-8 bytes are replaced.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let raw = self.read_blob()?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Reads exactly `n` raw bytes.
    pub fn read_data(&mut self, n: usize) -> Result<Bytes, WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = self.data.slice(self.offset..self.offset + n);
        self.offset += n;
        Ok(out)
    }

    /// Consumes and returns everything left in the datagram.
    pub fn read_remainder(&mut self) -> Bytes {
        let out = self.data.slice(self.offset..);
        self.offset = self.data.len();
        out
    }

    /// Copies exactly one field's wire-encoded bytes into `out`, walking the
    /// field's type metadata. Any shortfall fails with `Truncated` and the
    /// cursor is left mid-field.
    pub fn unpack_field(&mut self, field: &DcField, out: &mut Vec<u8>) -> Result<(), WireError> {
        self.unpack_type(field.field_type(), out)
    }

    fn unpack_type(&mut self, ty: &FieldType, out: &mut Vec<u8>) -> Result<(), WireError> {
        match ty {
            FieldType::Uint8 | FieldType::Int8 => self.copy_fixed(1, out),
            FieldType::Uint16 | FieldType::Int16 => self.copy_fixed(2, out),
            FieldType::Uint32 | FieldType::Int32 => self.copy_fixed(4, out),
            FieldType::Uint64 | FieldType::Int64 | FieldType::Float64 => self.copy_fixed(8, out),
            FieldType::String | FieldType::Blob | FieldType::VarArray(_) => {
                let len = self.read_u16()?;
                out.extend_from_slice(&len.to_le_bytes());
                let data = self.read_data(usize::from(len))?;
                out.extend_from_slice(&data);
                Ok(())
            }
            FieldType::Array(elem, count) => {
                for _ in 0..*count {
                    self.unpack_type(elem, out)?;
                }
                Ok(())
            }
            FieldType::Struct(members) => {
                for m in members {
                    self.unpack_type(m, out)?;
                }
                Ok(())
            }
        }
    }

    fn copy_fixed(&mut self, n: usize, out: &mut Vec<u8>) -> Result<(), WireError> {
        let data = self.read_data(n)?;
        out.extend_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_core::dclass::{ClassConfig, ClassRegistry};

    #[test]
    fn test_write_read_round_trip() {
        let mut dg = Datagram::new();
        dg.add_u8(7);
        dg.add_u16(0x1234);
        dg.add_u32(0xdead_beef);
        dg.add_u64(42);
        dg.add_string("hello").unwrap();

        let mut iter = DatagramIter::new(dg.freeze());
        assert_eq!(iter.read_u8().unwrap(), 7);
        assert_eq!(iter.read_u16().unwrap(), 0x1234);
        assert_eq!(iter.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(iter.read_u64().unwrap(), 42);
        assert_eq!(iter.read_string().unwrap(), "hello");
        assert_eq!(iter.remaining(), 0);
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut dg = Datagram::new();
        dg.add_u16(1);
        let mut iter = DatagramIter::new(dg.freeze());
        assert!(matches!(
            iter.read_u32(),
            Err(WireError::Truncated {
                needed: 4,
                remaining: 2
            })
        ));
    }

    #[test]
    fn test_truncated_string_fails() {
        let mut dg = Datagram::new();
        dg.add_u16(10); // length prefix promising more than follows
        dg.add_data(b"abc");
        let mut iter = DatagramIter::new(dg.freeze());
        assert!(matches!(iter.read_string(), Err(WireError::Truncated { .. })));
    }

    #[test]
    fn test_server_header_layout() {
        let dg = Datagram::with_server_header(0x0102, 0x0304, 0x2020);
        let mut iter = DatagramIter::new(dg.freeze());
        assert_eq!(iter.read_u8().unwrap(), 1);
        assert_eq!(iter.read_u64().unwrap(), 0x0102);
        assert_eq!(iter.read_u64().unwrap(), 0x0304);
        assert_eq!(iter.read_u16().unwrap(), 0x2020);
        assert_eq!(iter.remaining(), 0);
    }

    fn field_fixture(ty: &str) -> (ClassRegistry, u16) {
        let reg = ClassRegistry::from_config(
            &serde_json::from_value::<Vec<ClassConfig>>(serde_json::json!([{
                "name": "Probe",
                "fields": [{"name": "f", "type": ty, "keywords": ["clsend"]}]
            }]))
            .unwrap(),
        )
        .unwrap();
        (reg, 0)
    }

    #[test]
    fn test_unpack_fixed_field() {
        let (reg, idx) = field_fixture("uint32");
        let class = reg.get_class(0).unwrap();
        let field = class.field_by_index(idx).unwrap();

        let mut dg = Datagram::new();
        dg.add_u32(99);
        dg.add_u16(0xffff); // trailing bytes stay untouched
        let mut iter = DatagramIter::new(dg.freeze());

        let mut out = Vec::new();
        iter.unpack_field(field, &mut out).unwrap();
        assert_eq!(out, 99u32.to_le_bytes());
        assert_eq!(iter.remaining(), 2);
    }

    #[test]
    fn test_unpack_string_field_keeps_prefix() {
        let (reg, idx) = field_fixture("string");
        let class = reg.get_class(0).unwrap();
        let field = class.field_by_index(idx).unwrap();

        let mut dg = Datagram::new();
        dg.add_string("hi").unwrap();
        let mut iter = DatagramIter::new(dg.freeze());

        let mut out = Vec::new();
        iter.unpack_field(field, &mut out).unwrap();
        assert_eq!(out, [2, 0, b'h', b'i']);
    }

    #[test]
    fn test_unpack_fixed_array_field() {
        let (reg, idx) = field_fixture("uint16[3]");
        let class = reg.get_class(0).unwrap();
        let field = class.field_by_index(idx).unwrap();

        let mut dg = Datagram::new();
        for v in [1u16, 2, 3] {
            dg.add_u16(v);
        }
        let mut iter = DatagramIter::new(dg.freeze());

        let mut out = Vec::new();
        iter.unpack_field(field, &mut out).unwrap();
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn test_unpack_shortfall_is_truncated() {
        let (reg, idx) = field_fixture("uint64");
        let class = reg.get_class(0).unwrap();
        let field = class.field_by_index(idx).unwrap();

        let mut dg = Datagram::new();
        dg.add_u32(1); // only half the field
        let mut iter = DatagramIter::new(dg.freeze());

        let mut out = Vec::new();
        assert!(matches!(
            iter.unpack_field(field, &mut out),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_blob_length_overflow() {
        let mut dg = Datagram::new();
        let huge = vec![0u8; DATAGRAM_MAX_SIZE + 1];
        assert!(matches!(
            dg.add_blob(&huge),
            Err(WireError::LengthOverflow(_))
        ));
    }
}
