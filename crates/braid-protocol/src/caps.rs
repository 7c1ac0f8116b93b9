//! Capability exchange
//!
//! Each side sends one capabilities frame early in the handshake. The body
//! is a tag+length+value sequence so that either side can add tags without
//! breaking older peers; unknown tags are skipped, never fatal.

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::fields;

/// Capability field tags
pub mod tag {
    /// Maximum protocol version (u8)
    pub const VERSION: u8 = 0x00;
    /// One offered SASL-style mechanism name (utf8, repeated)
    pub const MECHANISM: u8 = 0x01;
    /// Peer is willing to upgrade to TLS mid-stream (empty)
    pub const STARTTLS: u8 = 0x02;
    /// Peer endpoint name (utf8)
    pub const ENDPOINT_NAME: u8 = 0x03;
    /// Peer handles asynchronous message close correctly (empty)
    pub const MESSAGE_CLOSE: u8 = 0x04;
    /// Human-readable implementation version (utf8)
    pub const VERSION_STRING: u8 = 0x05;
    /// Maximum inbound channels the peer will accept (u32)
    pub const CHANNELS_IN: u8 = 0x06;
    /// Maximum outbound channels the peer will open (u32)
    pub const CHANNELS_OUT: u8 = 0x07;
    /// Peer requires authentication before channels (empty)
    pub const AUTHENTICATION: u8 = 0x08;
}

/// The set of capabilities one peer advertised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Maximum protocol version the peer speaks
    pub version: u8,
    /// Offered authentication mechanisms, in preference order
    pub mechanisms: Vec<String>,
    /// Peer supports a mid-stream TLS upgrade
    pub starttls: bool,
    /// Peer endpoint name, if advertised
    pub endpoint_name: Option<String>,
    /// Peer handles asynchronous message close (no explicit ack frames needed)
    pub message_close: bool,
    /// Implementation version string, if advertised
    pub version_string: Option<String>,
    /// Channel limit the peer accepts inbound
    pub channels_in: Option<u32>,
    /// Channel limit the peer will open outbound
    pub channels_out: Option<u32>,
    /// Peer runs the authentication phase
    pub authentication: bool,
}

impl Capabilities {
    /// Encode into a frame body.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        fields::put_u8_field(dst, tag::VERSION, self.version);
        for mech in &self.mechanisms {
            fields::put_str_field(dst, tag::MECHANISM, mech)?;
        }
        if self.starttls {
            fields::put_empty_field(dst, tag::STARTTLS);
        }
        if let Some(name) = &self.endpoint_name {
            fields::put_str_field(dst, tag::ENDPOINT_NAME, name)?;
        }
        if self.message_close {
            fields::put_empty_field(dst, tag::MESSAGE_CLOSE);
        }
        if let Some(vs) = &self.version_string {
            fields::put_str_field(dst, tag::VERSION_STRING, vs)?;
        }
        if let Some(n) = self.channels_in {
            fields::put_u32_field(dst, tag::CHANNELS_IN, n);
        }
        if let Some(n) = self.channels_out {
            fields::put_u32_field(dst, tag::CHANNELS_OUT, n);
        }
        if self.authentication {
            fields::put_empty_field(dst, tag::AUTHENTICATION);
        }
        Ok(())
    }

    /// Decode from a frame body, skipping unknown tags.
    pub fn decode(mut src: Bytes) -> Result<Self, ProtocolError> {
        let mut caps = Capabilities::default();
        while let Some((tag, value)) = fields::next_field(&mut src)? {
            match tag {
                tag::VERSION => caps.version = fields::field_u8(tag, &value)?,
                tag::MECHANISM => caps
                    .mechanisms
                    .push(fields::field_str(&value, "mechanism")?),
                tag::STARTTLS => caps.starttls = true,
                tag::ENDPOINT_NAME => {
                    caps.endpoint_name = Some(fields::field_str(&value, "endpoint-name")?);
                }
                tag::MESSAGE_CLOSE => caps.message_close = true,
                tag::VERSION_STRING => {
                    caps.version_string = Some(fields::field_str(&value, "version-string")?);
                }
                tag::CHANNELS_IN => caps.channels_in = Some(fields::field_u32(tag, &value)?),
                tag::CHANNELS_OUT => caps.channels_out = Some(fields::field_u32(tag, &value)?),
                tag::AUTHENTICATION => caps.authentication = true,
                other => {
                    tracing::trace!("Skipping unknown capability tag {:#04x}", other);
                }
            }
        }
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Capabilities {
        Capabilities {
            version: 1,
            mechanisms: vec!["HMAC-SHA256".to_string(), "PLAIN".to_string()],
            starttls: true,
            endpoint_name: Some("node1".to_string()),
            message_close: true,
            version_string: Some("braid-0.1.0".to_string()),
            channels_in: Some(24),
            channels_out: Some(24),
            authentication: true,
        }
    }

    #[test]
    fn test_caps_roundtrip() {
        let caps = sample();
        let mut buf = BytesMut::new();
        caps.encode(&mut buf).unwrap();
        let decoded = Capabilities::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, caps);
    }

    #[test]
    fn test_unknown_tags_skipped() {
        let caps = sample();
        let mut buf = BytesMut::new();
        // A tag from the future, interleaved before and after known ones
        fields::put_field(&mut buf, 0x7F, b"future").unwrap();
        caps.encode(&mut buf).unwrap();
        fields::put_u32_field(&mut buf, 0x60, 99);
        let decoded = Capabilities::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, caps);
    }

    #[test]
    fn test_empty_body() {
        let decoded = Capabilities::decode(Bytes::new()).unwrap();
        assert_eq!(decoded, Capabilities::default());
        assert!(decoded.mechanisms.is_empty());
    }
}
