//! Tag + length + value field encoding
//!
//! Capability and channel-parameter frame bodies are self-describing
//! sequences of `u8 tag`, `u8 length`, `value` fields. Unknown tags are
//! skipped by consumers, which is what keeps the exchange forward
//! compatible.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Append a tagged field with an arbitrary value.
pub fn put_field(dst: &mut BytesMut, tag: u8, value: &[u8]) -> Result<(), ProtocolError> {
    if value.len() > u8::MAX as usize {
        return Err(ProtocolError::FieldTooLong { len: value.len() });
    }
    dst.reserve(2 + value.len());
    dst.put_u8(tag);
    dst.put_u8(value.len() as u8);
    dst.put_slice(value);
    Ok(())
}

/// Append a tagged field with an empty value (presence flag).
pub fn put_empty_field(dst: &mut BytesMut, tag: u8) {
    dst.put_u8(tag);
    dst.put_u8(0);
}

/// Append a tagged UTF-8 string field.
pub fn put_str_field(dst: &mut BytesMut, tag: u8, value: &str) -> Result<(), ProtocolError> {
    put_field(dst, tag, value.as_bytes())
}

/// Append a tagged u8 field.
pub fn put_u8_field(dst: &mut BytesMut, tag: u8, value: u8) {
    dst.put_u8(tag);
    dst.put_u8(1);
    dst.put_u8(value);
}

/// Append a tagged big-endian u16 field.
pub fn put_u16_field(dst: &mut BytesMut, tag: u8, value: u16) {
    dst.put_u8(tag);
    dst.put_u8(2);
    dst.put_u16(value);
}

/// Append a tagged big-endian u32 field.
pub fn put_u32_field(dst: &mut BytesMut, tag: u8, value: u32) {
    dst.put_u8(tag);
    dst.put_u8(4);
    dst.put_u32(value);
}

/// Append a tagged big-endian u64 field.
pub fn put_u64_field(dst: &mut BytesMut, tag: u8, value: u64) {
    dst.put_u8(tag);
    dst.put_u8(8);
    dst.put_u64(value);
}

/// Pull the next tagged field off the front of `src`.
///
/// Returns `Ok(None)` once the buffer is exhausted. A tag whose declared
/// value length runs past the end of the buffer is a framing error.
pub fn next_field(src: &mut Bytes) -> Result<Option<(u8, Bytes)>, ProtocolError> {
    if src.is_empty() {
        return Ok(None);
    }
    if src.len() < 2 {
        return Err(ProtocolError::Truncated {
            kind: "field",
            needed: 2 - src.len(),
        });
    }
    let tag = src.get_u8();
    let len = src.get_u8() as usize;
    if src.len() < len {
        return Err(ProtocolError::Truncated {
            kind: "field",
            needed: len - src.len(),
        });
    }
    Ok(Some((tag, src.split_to(len))))
}

/// Interpret a field value as a UTF-8 string.
pub fn field_str(value: &Bytes, what: &'static str) -> Result<String, ProtocolError> {
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8(what))
}

/// Interpret a field value as a u8.
pub fn field_u8(tag: u8, value: &Bytes) -> Result<u8, ProtocolError> {
    if value.len() != 1 {
        return Err(ProtocolError::BadFieldLength {
            tag,
            len: value.len(),
        });
    }
    Ok(value[0])
}

/// Interpret a field value as a big-endian u16.
pub fn field_u16(tag: u8, value: &Bytes) -> Result<u16, ProtocolError> {
    let arr: [u8; 2] = value[..]
        .try_into()
        .map_err(|_| ProtocolError::BadFieldLength {
            tag,
            len: value.len(),
        })?;
    Ok(u16::from_be_bytes(arr))
}

/// Interpret a field value as a big-endian u32.
pub fn field_u32(tag: u8, value: &Bytes) -> Result<u32, ProtocolError> {
    let arr: [u8; 4] = value[..]
        .try_into()
        .map_err(|_| ProtocolError::BadFieldLength {
            tag,
            len: value.len(),
        })?;
    Ok(u32::from_be_bytes(arr))
}

/// Interpret a field value as a big-endian u64.
pub fn field_u64(tag: u8, value: &Bytes) -> Result<u64, ProtocolError> {
    let arr: [u8; 8] = value[..]
        .try_into()
        .map_err(|_| ProtocolError::BadFieldLength {
            tag,
            len: value.len(),
        })?;
    Ok(u64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_roundtrip() {
        let mut buf = BytesMut::new();
        put_str_field(&mut buf, 0x01, "echo").unwrap();
        put_u32_field(&mut buf, 0x80, 16384);
        put_empty_field(&mut buf, 0x02);

        let mut src = buf.freeze();

        let (tag, value) = next_field(&mut src).unwrap().unwrap();
        assert_eq!(tag, 0x01);
        assert_eq!(field_str(&value, "service").unwrap(), "echo");

        let (tag, value) = next_field(&mut src).unwrap().unwrap();
        assert_eq!(tag, 0x80);
        assert_eq!(field_u32(tag, &value).unwrap(), 16384);

        let (tag, value) = next_field(&mut src).unwrap().unwrap();
        assert_eq!(tag, 0x02);
        assert!(value.is_empty());

        assert!(next_field(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_truncated_value() {
        let mut src = Bytes::from_static(&[0x01, 0x05, b'a', b'b']);
        assert!(matches!(
            next_field(&mut src),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_bad_numeric_length() {
        let mut buf = BytesMut::new();
        put_field(&mut buf, 0x06, &[0x01, 0x02]).unwrap();
        let mut src = buf.freeze();
        let (tag, value) = next_field(&mut src).unwrap().unwrap();
        assert!(matches!(
            field_u32(tag, &value),
            Err(ProtocolError::BadFieldLength { tag: 0x06, len: 2 })
        ));
    }

    #[test]
    fn test_value_too_long() {
        let mut buf = BytesMut::new();
        let big = vec![0u8; 300];
        assert!(matches!(
            put_field(&mut buf, 0x01, &big),
            Err(ProtocolError::FieldTooLong { len: 300 })
        ));
    }
}
