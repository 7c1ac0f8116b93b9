//! Frame types and body encoding
//!
//! Every frame on the wire is `u32 length` + `u8 type` + type-specific
//! body, big-endian throughout. The length prefix covers the type byte and
//! the body. This module defines the closed sum type over frame kinds and
//! the bit-exact body encoding for each; the length prefix itself is
//! handled by [`crate::codec::LengthCodec`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::caps::Capabilities;
use crate::error::ProtocolError;
use crate::ids::{ChannelId, MessageId};
use crate::params::ChannelParams;

/// Frame type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Handshake greeting
    Greeting = 0x01,
    /// Capability advertisement
    Capabilities = 0x02,
    /// Request a mid-stream TLS upgrade
    StartTls = 0x03,
    /// Agree to the TLS upgrade
    StartTlsAck = 0x04,
    /// Begin authentication with a chosen mechanism
    AuthRequest = 0x10,
    /// Server challenge
    AuthChallenge = 0x11,
    /// Client response
    AuthResponse = 0x12,
    /// Authentication succeeded
    AuthComplete = 0x13,
    /// Authentication attempt rejected
    AuthRejected = 0x14,
    /// Request to open a channel
    ChannelOpenRequest = 0x20,
    /// Channel open granted
    ChannelOpenAck = 0x21,
    /// Open refused: no such service
    ServiceNotFound = 0x22,
    /// Open refused: service failed
    ServiceError = 0x23,
    /// Half-close: no more messages will be sent on the channel
    ChannelShutdownWrite = 0x24,
    /// Channel fully closed
    ChannelClosed = 0x25,
    /// Message payload bytes
    MessageData = 0x30,
    /// Window credit for a message
    MessageWindowOpen = 0x31,
    /// Explicit message close acknowledgement (compatibility path)
    MessageClose = 0x32,
    /// Keepalive probe
    ConnectionAlive = 0x40,
    /// Keepalive reply
    ConnectionAliveAck = 0x41,
    /// Connection close request
    ConnectionClose = 0x42,
}

impl FrameKind {
    /// Convert to the wire byte
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from the wire byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Greeting),
            0x02 => Some(Self::Capabilities),
            0x03 => Some(Self::StartTls),
            0x04 => Some(Self::StartTlsAck),
            0x10 => Some(Self::AuthRequest),
            0x11 => Some(Self::AuthChallenge),
            0x12 => Some(Self::AuthResponse),
            0x13 => Some(Self::AuthComplete),
            0x14 => Some(Self::AuthRejected),
            0x20 => Some(Self::ChannelOpenRequest),
            0x21 => Some(Self::ChannelOpenAck),
            0x22 => Some(Self::ServiceNotFound),
            0x23 => Some(Self::ServiceError),
            0x24 => Some(Self::ChannelShutdownWrite),
            0x25 => Some(Self::ChannelClosed),
            0x30 => Some(Self::MessageData),
            0x31 => Some(Self::MessageWindowOpen),
            0x32 => Some(Self::MessageClose),
            0x40 => Some(Self::ConnectionAlive),
            0x41 => Some(Self::ConnectionAliveAck),
            0x42 => Some(Self::ConnectionClose),
            _ => None,
        }
    }
}

/// Per-frame flags carried on message data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(pub u8);

impl MessageFlags {
    /// Final frame of the message
    pub const EOF: u8 = 0x01;
    /// First frame of a new message
    pub const NEW: u8 = 0x02;
    /// Message was cancelled by the sender
    pub const CANCELLED: u8 = 0x04;

    /// No flags set
    pub fn empty() -> Self {
        Self(0)
    }

    /// Set the EOF bit
    pub fn with_eof(self) -> Self {
        Self(self.0 | Self::EOF)
    }

    /// Set the NEW bit
    pub fn with_new(self) -> Self {
        Self(self.0 | Self::NEW)
    }

    /// Set the CANCELLED bit
    pub fn with_cancelled(self) -> Self {
        Self(self.0 | Self::CANCELLED)
    }

    /// Whether the EOF bit is set
    pub fn eof(&self) -> bool {
        self.0 & Self::EOF != 0
    }

    /// Whether the NEW bit is set
    pub fn is_new(&self) -> bool {
        self.0 & Self::NEW != 0
    }

    /// Whether the CANCELLED bit is set
    pub fn cancelled(&self) -> bool {
        self.0 & Self::CANCELLED != 0
    }
}

/// A decoded protocol frame.
///
/// Dispatch is a `match` over this enum; each variant carries its typed
/// payload. `Unknown` preserves the type byte of a frame this
/// implementation does not understand so the dispatcher can skip it.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Handshake greeting carrying the sender's name
    Greeting {
        /// Endpoint name of the sender, if it advertises one
        server_name: Option<String>,
    },
    /// Capability advertisement
    Capabilities(Capabilities),
    /// Request a mid-stream TLS upgrade
    StartTls,
    /// Agree to the TLS upgrade
    StartTlsAck,
    /// Begin authentication with a chosen mechanism
    AuthRequest {
        /// Mechanism name
        mechanism: String,
        /// Mechanism-specific initial response
        initial: Bytes,
    },
    /// Server challenge
    AuthChallenge {
        /// Opaque challenge bytes
        payload: Bytes,
    },
    /// Client response
    AuthResponse {
        /// Opaque response bytes
        payload: Bytes,
    },
    /// Authentication succeeded
    AuthComplete {
        /// Final mechanism data, possibly empty
        payload: Bytes,
    },
    /// Authentication attempt rejected
    AuthRejected {
        /// Human-readable reason
        reason: String,
    },
    /// Request to open a channel
    ChannelOpenRequest {
        /// Requester-allocated channel ID
        id: ChannelId,
        /// Requested service name
        service: String,
        /// Requested limits
        params: ChannelParams,
    },
    /// Channel open granted with the agreed limits
    ChannelOpenAck {
        /// Channel ID from the request
        id: ChannelId,
        /// Agreed limits
        params: ChannelParams,
    },
    /// Open refused: no such service
    ServiceNotFound {
        /// Channel ID from the request
        id: ChannelId,
        /// Human-readable reason
        reason: String,
    },
    /// Open refused: service failed to accept
    ServiceError {
        /// Channel ID from the request
        id: ChannelId,
        /// Human-readable reason
        reason: String,
    },
    /// Half-close: sender will open no more messages on the channel
    ChannelShutdownWrite {
        /// Channel being half-closed
        id: ChannelId,
    },
    /// Channel fully closed
    ChannelClosed {
        /// Channel being closed
        id: ChannelId,
    },
    /// Message payload bytes
    MessageData {
        /// Parent channel
        channel: ChannelId,
        /// Message within the channel
        message: MessageId,
        /// EOF / NEW / CANCELLED flags
        flags: MessageFlags,
        /// Payload bytes
        payload: Bytes,
    },
    /// Window credit for a message
    MessageWindowOpen {
        /// Parent channel
        channel: ChannelId,
        /// Message within the channel
        message: MessageId,
        /// Bytes of window being opened
        credit: u32,
    },
    /// Explicit message close acknowledgement (compatibility path)
    MessageClose {
        /// Parent channel
        channel: ChannelId,
        /// Message being retired
        message: MessageId,
    },
    /// Keepalive probe
    ConnectionAlive,
    /// Keepalive reply
    ConnectionAliveAck,
    /// Connection close request
    ConnectionClose,
    /// A frame type this implementation does not understand
    Unknown {
        /// The unrecognized type byte
        kind: u8,
    },
}

impl Frame {
    /// The wire type of this frame, or the raw byte for `Unknown`.
    pub fn kind_byte(&self) -> u8 {
        match self {
            Frame::Greeting { .. } => FrameKind::Greeting.as_u8(),
            Frame::Capabilities(_) => FrameKind::Capabilities.as_u8(),
            Frame::StartTls => FrameKind::StartTls.as_u8(),
            Frame::StartTlsAck => FrameKind::StartTlsAck.as_u8(),
            Frame::AuthRequest { .. } => FrameKind::AuthRequest.as_u8(),
            Frame::AuthChallenge { .. } => FrameKind::AuthChallenge.as_u8(),
            Frame::AuthResponse { .. } => FrameKind::AuthResponse.as_u8(),
            Frame::AuthComplete { .. } => FrameKind::AuthComplete.as_u8(),
            Frame::AuthRejected { .. } => FrameKind::AuthRejected.as_u8(),
            Frame::ChannelOpenRequest { .. } => FrameKind::ChannelOpenRequest.as_u8(),
            Frame::ChannelOpenAck { .. } => FrameKind::ChannelOpenAck.as_u8(),
            Frame::ServiceNotFound { .. } => FrameKind::ServiceNotFound.as_u8(),
            Frame::ServiceError { .. } => FrameKind::ServiceError.as_u8(),
            Frame::ChannelShutdownWrite { .. } => FrameKind::ChannelShutdownWrite.as_u8(),
            Frame::ChannelClosed { .. } => FrameKind::ChannelClosed.as_u8(),
            Frame::MessageData { .. } => FrameKind::MessageData.as_u8(),
            Frame::MessageWindowOpen { .. } => FrameKind::MessageWindowOpen.as_u8(),
            Frame::MessageClose { .. } => FrameKind::MessageClose.as_u8(),
            Frame::ConnectionAlive => FrameKind::ConnectionAlive.as_u8(),
            Frame::ConnectionAliveAck => FrameKind::ConnectionAliveAck.as_u8(),
            Frame::ConnectionClose => FrameKind::ConnectionClose.as_u8(),
            Frame::Unknown { kind } => *kind,
        }
    }

    /// Encode the type byte and body (everything the length prefix covers).
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.put_u8(self.kind_byte());
        match self {
            Frame::Greeting { server_name } => {
                if let Some(name) = server_name {
                    crate::fields::put_str_field(dst, 0x00, name)?;
                }
            }
            Frame::Capabilities(caps) => caps.encode(dst)?,
            Frame::StartTls
            | Frame::StartTlsAck
            | Frame::ConnectionAlive
            | Frame::ConnectionAliveAck
            | Frame::ConnectionClose => {}
            Frame::AuthRequest { mechanism, initial } => {
                let name = mechanism.as_bytes();
                if name.len() > u8::MAX as usize {
                    return Err(ProtocolError::FieldTooLong { len: name.len() });
                }
                dst.put_u8(name.len() as u8);
                dst.put_slice(name);
                dst.put_slice(initial);
            }
            Frame::AuthChallenge { payload }
            | Frame::AuthResponse { payload }
            | Frame::AuthComplete { payload } => {
                dst.put_slice(payload);
            }
            Frame::AuthRejected { reason } => {
                dst.put_slice(reason.as_bytes());
            }
            Frame::ChannelOpenRequest {
                id,
                service,
                params,
            } => {
                dst.put_u32(id.as_u32());
                params.encode(dst, Some(service))?;
            }
            Frame::ChannelOpenAck { id, params } => {
                dst.put_u32(id.as_u32());
                params.encode(dst, None)?;
            }
            Frame::ServiceNotFound { id, reason } | Frame::ServiceError { id, reason } => {
                dst.put_u32(id.as_u32());
                dst.put_slice(reason.as_bytes());
            }
            Frame::ChannelShutdownWrite { id } | Frame::ChannelClosed { id } => {
                dst.put_u32(id.as_u32());
            }
            Frame::MessageData {
                channel,
                message,
                flags,
                payload,
            } => {
                dst.put_u32(channel.as_u32());
                dst.put_u16(message.as_u16());
                dst.put_u8(flags.0);
                dst.put_slice(payload);
            }
            Frame::MessageWindowOpen {
                channel,
                message,
                credit,
            } => {
                dst.put_u32(channel.as_u32());
                dst.put_u16(message.as_u16());
                dst.put_u32(*credit);
            }
            Frame::MessageClose { channel, message } => {
                dst.put_u32(channel.as_u32());
                dst.put_u16(message.as_u16());
            }
            Frame::Unknown { .. } => {}
        }
        Ok(())
    }

    /// Parse a frame from its length-stripped wire bytes (type byte + body).
    ///
    /// An unrecognized type byte yields `Frame::Unknown` so the caller can
    /// skip it; a recognized type with a truncated body is a framing error.
    pub fn parse(mut src: Bytes) -> Result<Frame, ProtocolError> {
        if src.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        let kind_byte = src.get_u8();
        let Some(kind) = FrameKind::from_u8(kind_byte) else {
            return Ok(Frame::Unknown { kind: kind_byte });
        };

        match kind {
            FrameKind::Greeting => {
                let mut server_name = None;
                let mut body = src;
                while let Some((tag, value)) = crate::fields::next_field(&mut body)? {
                    match tag {
                        0x00 => server_name = Some(crate::fields::field_str(&value, "server-name")?),
                        other => {
                            tracing::trace!("Skipping unknown greeting tag {:#04x}", other);
                        }
                    }
                }
                Ok(Frame::Greeting { server_name })
            }
            FrameKind::Capabilities => Ok(Frame::Capabilities(Capabilities::decode(src)?)),
            FrameKind::StartTls => Ok(Frame::StartTls),
            FrameKind::StartTlsAck => Ok(Frame::StartTlsAck),
            FrameKind::AuthRequest => {
                need(&src, 1, "auth-request")?;
                let name_len = src.get_u8() as usize;
                need(&src, name_len, "auth-request")?;
                let name = src.split_to(name_len);
                let mechanism = std::str::from_utf8(&name)
                    .map_err(|_| ProtocolError::InvalidUtf8("mechanism"))?
                    .to_owned();
                Ok(Frame::AuthRequest {
                    mechanism,
                    initial: src,
                })
            }
            FrameKind::AuthChallenge => Ok(Frame::AuthChallenge { payload: src }),
            FrameKind::AuthResponse => Ok(Frame::AuthResponse { payload: src }),
            FrameKind::AuthComplete => Ok(Frame::AuthComplete { payload: src }),
            FrameKind::AuthRejected => {
                let reason = std::str::from_utf8(&src)
                    .map_err(|_| ProtocolError::InvalidUtf8("reason"))?
                    .to_owned();
                Ok(Frame::AuthRejected { reason })
            }
            FrameKind::ChannelOpenRequest => {
                need(&src, 4, "channel-open-request")?;
                let id = ChannelId::new(src.get_u32());
                let (params, service) = ChannelParams::decode(src)?;
                let service = service.unwrap_or_default();
                Ok(Frame::ChannelOpenRequest {
                    id,
                    service,
                    params,
                })
            }
            FrameKind::ChannelOpenAck => {
                need(&src, 4, "channel-open-ack")?;
                let id = ChannelId::new(src.get_u32());
                let (params, _) = ChannelParams::decode(src)?;
                Ok(Frame::ChannelOpenAck { id, params })
            }
            FrameKind::ServiceNotFound | FrameKind::ServiceError => {
                need(&src, 4, "channel-open-refusal")?;
                let id = ChannelId::new(src.get_u32());
                let reason = std::str::from_utf8(&src)
                    .map_err(|_| ProtocolError::InvalidUtf8("reason"))?
                    .to_owned();
                if kind == FrameKind::ServiceNotFound {
                    Ok(Frame::ServiceNotFound { id, reason })
                } else {
                    Ok(Frame::ServiceError { id, reason })
                }
            }
            FrameKind::ChannelShutdownWrite => {
                need(&src, 4, "channel-shutdown-write")?;
                Ok(Frame::ChannelShutdownWrite {
                    id: ChannelId::new(src.get_u32()),
                })
            }
            FrameKind::ChannelClosed => {
                need(&src, 4, "channel-closed")?;
                Ok(Frame::ChannelClosed {
                    id: ChannelId::new(src.get_u32()),
                })
            }
            FrameKind::MessageData => {
                need(&src, 7, "message-data")?;
                let channel = ChannelId::new(src.get_u32());
                let message = MessageId::new(src.get_u16());
                let flags = MessageFlags(src.get_u8());
                Ok(Frame::MessageData {
                    channel,
                    message,
                    flags,
                    payload: src,
                })
            }
            FrameKind::MessageWindowOpen => {
                need(&src, 10, "message-window-open")?;
                let channel = ChannelId::new(src.get_u32());
                let message = MessageId::new(src.get_u16());
                let credit = src.get_u32();
                Ok(Frame::MessageWindowOpen {
                    channel,
                    message,
                    credit,
                })
            }
            FrameKind::MessageClose => {
                need(&src, 6, "message-close")?;
                let channel = ChannelId::new(src.get_u32());
                let message = MessageId::new(src.get_u16());
                Ok(Frame::MessageClose { channel, message })
            }
            // Padding after the type byte is tolerated on bodyless frames
            FrameKind::ConnectionAlive => Ok(Frame::ConnectionAlive),
            FrameKind::ConnectionAliveAck => Ok(Frame::ConnectionAliveAck),
            FrameKind::ConnectionClose => Ok(Frame::ConnectionClose),
        }
    }
}

fn need(src: &Bytes, n: usize, kind: &'static str) -> Result<(), ProtocolError> {
    if src.len() < n {
        return Err(ProtocolError::Truncated {
            kind,
            needed: n - src.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        Frame::parse(buf.freeze()).unwrap()
    }

    #[test]
    fn test_greeting_roundtrip() {
        let frame = Frame::Greeting {
            server_name: Some("node1".to_string()),
        };
        assert_eq!(roundtrip(frame.clone()), frame);

        let anon = Frame::Greeting { server_name: None };
        assert_eq!(roundtrip(anon.clone()), anon);
    }

    #[test]
    fn test_auth_frames_roundtrip() {
        let frame = Frame::AuthRequest {
            mechanism: "HMAC-SHA256".to_string(),
            initial: Bytes::from_static(b"user"),
        };
        assert_eq!(roundtrip(frame.clone()), frame);

        let frame = Frame::AuthChallenge {
            payload: Bytes::from_static(&[0xAA; 32]),
        };
        assert_eq!(roundtrip(frame.clone()), frame);

        let frame = Frame::AuthRejected {
            reason: "bad proof".to_string(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_channel_open_roundtrip() {
        let frame = Frame::ChannelOpenRequest {
            id: ChannelId::new(0x8000_0042),
            service: "echo".to_string(),
            params: ChannelParams::default(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);

        let frame = Frame::ServiceNotFound {
            id: ChannelId::new(0x8000_0042),
            reason: "no such service: echo2".to_string(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_message_data_roundtrip() {
        let frame = Frame::MessageData {
            channel: ChannelId::new(0x8000_0001),
            message: MessageId::new(7),
            flags: MessageFlags::empty().with_new().with_eof(),
            payload: Bytes::from_static(b"hello, world"),
        };
        let decoded = roundtrip(frame.clone());
        assert_eq!(decoded, frame);
        if let Frame::MessageData { flags, .. } = decoded {
            assert!(flags.is_new());
            assert!(flags.eof());
            assert!(!flags.cancelled());
        } else {
            panic!("Expected MessageData");
        }
    }

    #[test]
    fn test_window_open_roundtrip() {
        let frame = Frame::MessageWindowOpen {
            channel: ChannelId::new(3),
            message: MessageId::new(9),
            credit: 16384,
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_bodyless_frames() {
        for frame in [
            Frame::ConnectionAlive,
            Frame::ConnectionAliveAck,
            Frame::ConnectionClose,
            Frame::StartTls,
            Frame::StartTlsAck,
        ] {
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_alive_tolerates_padding() {
        let decoded = Frame::parse(Bytes::from_static(&[0x40, 0, 0, 0])).unwrap();
        assert_eq!(decoded, Frame::ConnectionAlive);
    }

    #[test]
    fn test_unknown_kind_preserved() {
        let decoded = Frame::parse(Bytes::from_static(&[0xEE, 1, 2, 3])).unwrap();
        assert_eq!(decoded, Frame::Unknown { kind: 0xEE });
    }

    #[test]
    fn test_truncated_body_is_error() {
        // message-data with only 2 of the 7 required header bytes
        let result = Frame::parse(Bytes::from_static(&[0x30, 0x00, 0x00]));
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_empty_frame_is_error() {
        assert!(matches!(
            Frame::parse(Bytes::new()),
            Err(ProtocolError::EmptyFrame)
        ));
    }
}
