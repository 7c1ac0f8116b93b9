//! Channel open parameters
//!
//! A channel-open request carries the requester's desired window sizes,
//! in-flight message counts and total message size caps; the ack carries
//! the values the responder agreed to (the minimum of requested and
//! configured on its side). All values are expressed from the requester's
//! point of view: "inbound" means toward the requester.

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::fields;
use crate::{DEFAULT_MAX_MESSAGES, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_WINDOW_SIZE};

/// Channel parameter field tags
pub mod tag {
    /// Requested service name (utf8, request only)
    pub const SERVICE: u8 = 0x01;
    /// Window toward the requester, bytes (u32)
    pub const INBOUND_WINDOW: u8 = 0x80;
    /// In-flight message cap toward the requester (u16)
    pub const INBOUND_MESSAGES: u8 = 0x81;
    /// Window away from the requester, bytes (u32)
    pub const OUTBOUND_WINDOW: u8 = 0x82;
    /// In-flight message cap away from the requester (u16)
    pub const OUTBOUND_MESSAGES: u8 = 0x83;
    /// Total size cap per message toward the requester (u64)
    pub const INBOUND_MESSAGE_SIZE: u8 = 0x84;
    /// Total size cap per message away from the requester (u64)
    pub const OUTBOUND_MESSAGE_SIZE: u8 = 0x85;
}

/// Negotiable per-channel limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParams {
    /// Window toward the requester, in bytes
    pub inbound_window: u32,
    /// In-flight message cap toward the requester
    pub inbound_messages: u16,
    /// Window away from the requester, in bytes
    pub outbound_window: u32,
    /// In-flight message cap away from the requester
    pub outbound_messages: u16,
    /// Per-message total size cap toward the requester
    pub inbound_message_size: u64,
    /// Per-message total size cap away from the requester
    pub outbound_message_size: u64,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            inbound_window: DEFAULT_WINDOW_SIZE,
            inbound_messages: DEFAULT_MAX_MESSAGES,
            outbound_window: DEFAULT_WINDOW_SIZE,
            outbound_messages: DEFAULT_MAX_MESSAGES,
            inbound_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ChannelParams {
    /// Combine with the responder's configured limits, taking the minimum
    /// of every field. `configured` is expressed from the responder's point
    /// of view, so inbound/outbound swap sides here.
    pub fn agree(&self, configured: &ChannelParams) -> ChannelParams {
        ChannelParams {
            inbound_window: self.inbound_window.min(configured.outbound_window),
            inbound_messages: self.inbound_messages.min(configured.outbound_messages),
            outbound_window: self.outbound_window.min(configured.inbound_window),
            outbound_messages: self.outbound_messages.min(configured.inbound_messages),
            inbound_message_size: self
                .inbound_message_size
                .min(configured.outbound_message_size),
            outbound_message_size: self
                .outbound_message_size
                .min(configured.inbound_message_size),
        }
    }

    /// The same parameters seen from the other endpoint.
    pub fn flipped(&self) -> ChannelParams {
        ChannelParams {
            inbound_window: self.outbound_window,
            inbound_messages: self.outbound_messages,
            outbound_window: self.inbound_window,
            outbound_messages: self.inbound_messages,
            inbound_message_size: self.outbound_message_size,
            outbound_message_size: self.inbound_message_size,
        }
    }

    /// Encode into a frame body, optionally with a leading service name.
    pub fn encode(&self, dst: &mut BytesMut, service: Option<&str>) -> Result<(), ProtocolError> {
        if let Some(name) = service {
            fields::put_str_field(dst, tag::SERVICE, name)?;
        }
        fields::put_u32_field(dst, tag::INBOUND_WINDOW, self.inbound_window);
        fields::put_u16_field(dst, tag::INBOUND_MESSAGES, self.inbound_messages);
        fields::put_u32_field(dst, tag::OUTBOUND_WINDOW, self.outbound_window);
        fields::put_u16_field(dst, tag::OUTBOUND_MESSAGES, self.outbound_messages);
        fields::put_u64_field(dst, tag::INBOUND_MESSAGE_SIZE, self.inbound_message_size);
        fields::put_u64_field(dst, tag::OUTBOUND_MESSAGE_SIZE, self.outbound_message_size);
        Ok(())
    }

    /// Decode from a frame body. Absent tags keep their defaults; unknown
    /// tags are skipped. Returns the parameters and the service name if one
    /// was present.
    pub fn decode(mut src: Bytes) -> Result<(ChannelParams, Option<String>), ProtocolError> {
        let mut params = ChannelParams::default();
        let mut service = None;
        while let Some((tag, value)) = fields::next_field(&mut src)? {
            match tag {
                tag::SERVICE => service = Some(fields::field_str(&value, "service")?),
                tag::INBOUND_WINDOW => params.inbound_window = fields::field_u32(tag, &value)?,
                tag::INBOUND_MESSAGES => params.inbound_messages = fields::field_u16(tag, &value)?,
                tag::OUTBOUND_WINDOW => params.outbound_window = fields::field_u32(tag, &value)?,
                tag::OUTBOUND_MESSAGES => {
                    params.outbound_messages = fields::field_u16(tag, &value)?;
                }
                tag::INBOUND_MESSAGE_SIZE => {
                    params.inbound_message_size = fields::field_u64(tag, &value)?;
                }
                tag::OUTBOUND_MESSAGE_SIZE => {
                    params.outbound_message_size = fields::field_u64(tag, &value)?;
                }
                other => {
                    tracing::trace!("Skipping unknown channel parameter tag {:#04x}", other);
                }
            }
        }
        Ok((params, service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_roundtrip_with_service() {
        let params = ChannelParams {
            inbound_window: 4096,
            inbound_messages: 10,
            outbound_window: 8192,
            outbound_messages: 20,
            inbound_message_size: 1 << 20,
            outbound_message_size: 1 << 21,
        };
        let mut buf = BytesMut::new();
        params.encode(&mut buf, Some("echo")).unwrap();
        let (decoded, service) = ChannelParams::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, params);
        assert_eq!(service.as_deref(), Some("echo"));
    }

    #[test]
    fn test_agree_takes_minimum() {
        let requested = ChannelParams {
            inbound_window: 64 * 1024,
            inbound_messages: 100,
            outbound_window: 1024,
            outbound_messages: 5,
            inbound_message_size: 1 << 30,
            outbound_message_size: 1 << 30,
        };
        let configured = ChannelParams::default();
        let agreed = requested.agree(&configured);

        // Requester inbound capped by responder's outbound side
        assert_eq!(agreed.inbound_window, DEFAULT_WINDOW_SIZE);
        assert_eq!(agreed.inbound_messages, DEFAULT_MAX_MESSAGES);
        // Requester asked for less outbound than configured; its value wins
        assert_eq!(agreed.outbound_window, 1024);
        assert_eq!(agreed.outbound_messages, 5);
    }

    #[test]
    fn test_flipped_is_involution() {
        let params = ChannelParams {
            inbound_window: 1,
            inbound_messages: 2,
            outbound_window: 3,
            outbound_messages: 4,
            inbound_message_size: 5,
            outbound_message_size: 6,
        };
        assert_eq!(params.flipped().flipped(), params);
        assert_eq!(params.flipped().inbound_window, 3);
    }
}
