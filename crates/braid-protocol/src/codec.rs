//! Length-prefix codec
//!
//! Splits a raw byte stream into length-delimited frame bodies. Frame
//! parsing happens in a second step ([`crate::frame::Frame::parse`]) so
//! that a post-authentication unwrap transform can sit between the two.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame size (type byte + body) this implementation accepts.
///
/// Anything larger is a framing error, fatal to the connection.
pub const MAX_FRAME_SIZE: usize = 0x00FF_FFFF;

/// Codec for the outer `u32 length` framing.
///
/// Decoding never blocks: it returns `Ok(None)` while the buffered bytes
/// fall short of a full frame, and the framed stream yields `None` on peer
/// disconnect. Repeated zero-length reads are harmless; the accumulation
/// buffer is only touched when bytes actually arrive.
#[derive(Debug, Default)]
pub struct LengthCodec {
    /// Length of the frame currently being accumulated, if the prefix has
    /// been consumed already
    pending_len: Option<usize>,
}

impl LengthCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { pending_len: None }
    }
}

impl Decoder for LengthCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.pending_len.take() {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let len = src.get_u32() as usize;
                if len == 0 {
                    return Err(ProtocolError::EmptyFrame);
                }
                if len > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: len,
                        max: MAX_FRAME_SIZE,
                    });
                }
                len
            }
        };

        if src.len() < len {
            // Save the length and wait for more data
            self.pending_len = Some(len);
            src.reserve(len - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for LengthCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if body.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        if body.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn encode_frame(frame: &Frame) -> BytesMut {
        let mut body = BytesMut::new();
        frame.encode(&mut body).unwrap();
        let mut wire = BytesMut::new();
        LengthCodec::new().encode(body.freeze(), &mut wire).unwrap();
        wire
    }

    #[test]
    fn test_codec_roundtrip() {
        let frame = Frame::Greeting {
            server_name: Some("node1".to_string()),
        };
        let mut wire = encode_frame(&frame);

        let mut codec = LengthCodec::new();
        let body = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(Frame::parse(body).unwrap(), frame);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_one_byte_reads_match_whole_frame() {
        let frame = Frame::MessageData {
            channel: crate::ChannelId::new(0x8000_0001),
            message: crate::MessageId::new(1),
            flags: crate::MessageFlags::empty().with_new(),
            payload: Bytes::from_static(b"split me across reads"),
        };
        let wire = encode_frame(&frame);

        let mut codec = LengthCodec::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for (i, byte) in wire.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            match codec.decode(&mut buf).unwrap() {
                Some(body) => {
                    assert_eq!(i, wire.len() - 1, "Frame completed early");
                    decoded = Some(Frame::parse(body).unwrap());
                }
                None => assert!(i < wire.len() - 1),
            }
        }
        assert_eq!(decoded.unwrap(), frame);
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = Frame::ConnectionAlive;
        let second = Frame::ConnectionAliveAck;
        let mut wire = encode_frame(&first);
        wire.extend_from_slice(&encode_frame(&second));

        let mut codec = LengthCodec::new();
        let a = codec.decode(&mut wire).unwrap().unwrap();
        let b = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(Frame::parse(a).unwrap(), first);
        assert_eq!(Frame::parse(b).unwrap(), second);
        assert!(codec.decode(&mut wire).unwrap().is_none());
    }

    #[test]
    fn test_empty_decode_is_idempotent() {
        let mut codec = LengthCodec::new();
        let mut buf = BytesMut::new();
        for _ in 0..3 {
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
    }

    #[test]
    fn test_zero_length_frame_rejected() {
        let mut codec = LengthCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::EmptyFrame)
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = LengthCodec::new();
        let mut buf = BytesMut::from(&[0xFFu8, 0xFF, 0xFF, 0xFF][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
