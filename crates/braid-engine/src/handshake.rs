//! Handshake and capability negotiation
//!
//! Sequence, initiator side: send greeting, await greeting, send
//! capabilities, await capabilities, then optionally starttls before
//! authentication begins. The responder mirrors it. Unknown frame types
//! and capability tags are skipped throughout; a genuinely out-of-place
//! frame is fatal.

use std::sync::Arc;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{Framed, FramedParts};

use braid_core::{BoxTransport, ConnectionError, EngineConfig, HandshakeError, TlsUpgrader};
use braid_protocol::{Capabilities, Frame, LengthCodec, VERSION_STRING};

/// Peer behavior derived from the capability tags it sent, threaded
/// through to the transport layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerFlags {
    /// Peer handles asynchronous message close; no explicit close
    /// acknowledgement frames are needed
    pub message_close: bool,
    /// Peer is willing to upgrade to TLS
    pub starttls: bool,
    /// Peer runs an authentication phase
    pub authentication: bool,
}

impl PeerFlags {
    fn from_caps(caps: &Capabilities) -> Self {
        Self {
            message_close: caps.message_close,
            starttls: caps.starttls,
            authentication: caps.authentication,
        }
    }
}

/// Everything the handshake established.
pub(crate) struct HandshakeOutcome {
    /// The framed stream, possibly rebuilt over TLS
    pub framed: Framed<BoxTransport, LengthCodec>,
    /// Negotiated protocol version (minimum of both maxima)
    pub version: u8,
    /// Peer's advertised endpoint name
    pub peer_name: Option<String>,
    /// The peer's full capability set
    pub peer_caps: Capabilities,
    /// Behavior flags derived from the capability set
    pub flags: PeerFlags,
    /// A frame the responder consumed while watching for starttls, to be
    /// fed to the next phase
    pub pending: Option<Frame>,
}

/// Send one frame and flush it.
pub(crate) async fn send_frame(
    framed: &mut Framed<BoxTransport, LengthCodec>,
    frame: Frame,
) -> Result<(), ConnectionError> {
    let mut body = BytesMut::new();
    frame.encode(&mut body)?;
    framed.send(body.freeze()).await?;
    Ok(())
}

/// Receive the next understood frame, skipping unknown types.
pub(crate) async fn recv_frame(
    framed: &mut Framed<BoxTransport, LengthCodec>,
) -> Result<Option<Frame>, ConnectionError> {
    loop {
        let Some(body) = framed.next().await.transpose()? else {
            return Ok(None);
        };
        match Frame::parse(body)? {
            Frame::Unknown { kind } => {
                tracing::trace!("Skipping unknown frame type {:#04x}", kind);
            }
            frame => return Ok(Some(frame)),
        }
    }
}

async fn recv_required(
    framed: &mut Framed<BoxTransport, LengthCodec>,
) -> Result<Frame, ConnectionError> {
    recv_frame(framed)
        .await?
        .ok_or(ConnectionError::Handshake(HandshakeError::PeerClosed))
}

fn local_caps(config: &EngineConfig, offered: &[String], tls_available: bool) -> Capabilities {
    Capabilities {
        version: config.protocol_version,
        mechanisms: offered.to_vec(),
        starttls: tls_available,
        endpoint_name: config.endpoint_name.clone(),
        message_close: true,
        version_string: Some(VERSION_STRING.to_string()),
        channels_in: Some(config.max_inbound_channels as u32),
        channels_out: Some(config.max_outbound_channels as u32),
        authentication: !offered.is_empty(),
    }
}

fn negotiate_version(ours: u8, theirs: u8) -> Result<u8, HandshakeError> {
    let version = ours.min(theirs);
    if version == 0 {
        return Err(HandshakeError::VersionMismatch {
            peer: theirs,
            ours,
        });
    }
    Ok(version)
}

async fn rebuild_over_tls(
    framed: Framed<BoxTransport, LengthCodec>,
    upgrader: &Arc<dyn TlsUpgrader>,
) -> Result<Framed<BoxTransport, LengthCodec>, ConnectionError> {
    let old = framed.into_parts();
    let io = upgrader.upgrade(old.io).await?;
    let mut parts = FramedParts::new::<bytes::Bytes>(io, LengthCodec::new());
    parts.read_buf = old.read_buf;
    parts.write_buf = old.write_buf;
    Ok(Framed::from_parts(parts))
}

/// Run the handshake as the connecting side.
pub(crate) async fn initiate(
    stream: BoxTransport,
    config: &EngineConfig,
    tls: Option<&Arc<dyn TlsUpgrader>>,
) -> Result<HandshakeOutcome, ConnectionError> {
    if config.require_tls && tls.is_none() {
        return Err(HandshakeError::NoTlsUpgrader.into());
    }
    let mut framed = Framed::new(stream, LengthCodec::new());

    send_frame(
        &mut framed,
        Frame::Greeting {
            server_name: config.endpoint_name.clone(),
        },
    )
    .await?;

    let peer_name = match recv_required(&mut framed).await? {
        Frame::Greeting { server_name } => server_name,
        other => {
            return Err(HandshakeError::UnexpectedFrame(other.kind_byte()).into());
        }
    };
    tracing::debug!("Peer greeting, server name {:?}", peer_name);

    send_frame(
        &mut framed,
        Frame::Capabilities(local_caps(config, &[], tls.is_some())),
    )
    .await?;

    let peer_caps = match recv_required(&mut framed).await? {
        Frame::Capabilities(caps) => caps,
        other => {
            return Err(HandshakeError::UnexpectedFrame(other.kind_byte()).into());
        }
    };

    let version = negotiate_version(config.protocol_version, peer_caps.version)?;
    tracing::debug!(
        "Negotiated protocol version {} (peer {:?})",
        version,
        peer_caps.version_string
    );

    // TLS upgrade before authentication, if both sides are able
    if let Some(upgrader) = tls {
        if peer_caps.starttls {
            send_frame(&mut framed, Frame::StartTls).await?;
            match recv_required(&mut framed).await? {
                Frame::StartTlsAck => {}
                other => {
                    return Err(HandshakeError::UnexpectedFrame(other.kind_byte()).into());
                }
            }
            framed = rebuild_over_tls(framed, upgrader).await?;
            tracing::debug!("Stream upgraded to TLS");
        } else if config.require_tls {
            return Err(HandshakeError::TlsNotSupported.into());
        }
    }

    let flags = PeerFlags::from_caps(&peer_caps);
    Ok(HandshakeOutcome {
        framed,
        version,
        peer_name,
        peer_caps,
        flags,
        pending: None,
    })
}

/// Run the handshake as the accepting side.
///
/// `offered` is the mechanism list to advertise. When a TLS upgrader is
/// configured, the next frame after the capability exchange is read here
/// to catch a starttls request; if it turns out to be something else it is
/// returned as `pending` for the next phase.
pub(crate) async fn accept(
    stream: BoxTransport,
    config: &EngineConfig,
    offered: &[String],
    tls: Option<&Arc<dyn TlsUpgrader>>,
) -> Result<HandshakeOutcome, ConnectionError> {
    if config.require_tls && tls.is_none() {
        return Err(HandshakeError::NoTlsUpgrader.into());
    }
    let mut framed = Framed::new(stream, LengthCodec::new());

    let peer_name = match recv_required(&mut framed).await? {
        Frame::Greeting { server_name } => server_name,
        other => {
            return Err(HandshakeError::UnexpectedFrame(other.kind_byte()).into());
        }
    };

    send_frame(
        &mut framed,
        Frame::Greeting {
            server_name: config.endpoint_name.clone(),
        },
    )
    .await?;

    let peer_caps = match recv_required(&mut framed).await? {
        Frame::Capabilities(caps) => caps,
        other => {
            return Err(HandshakeError::UnexpectedFrame(other.kind_byte()).into());
        }
    };

    send_frame(
        &mut framed,
        Frame::Capabilities(local_caps(config, offered, tls.is_some())),
    )
    .await?;

    let version = negotiate_version(config.protocol_version, peer_caps.version)?;
    tracing::debug!("Negotiated protocol version {}", version);

    let mut pending = None;
    if let Some(upgrader) = tls {
        match recv_required(&mut framed).await? {
            Frame::StartTls => {
                send_frame(&mut framed, Frame::StartTlsAck).await?;
                framed = rebuild_over_tls(framed, upgrader).await?;
                tracing::debug!("Stream upgraded to TLS");
            }
            other if config.require_tls => {
                let _ = other;
                return Err(HandshakeError::TlsNotSupported.into());
            }
            other => pending = Some(other),
        }
    }

    let flags = PeerFlags::from_caps(&peer_caps);
    Ok(HandshakeOutcome {
        framed,
        version,
        peer_name,
        peer_caps,
        flags,
        pending,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn config(name: &str) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.endpoint_name = Some(name.to_string());
        config
    }

    #[tokio::test]
    async fn test_plain_handshake() {
        let (a, b) = duplex(64 * 1024);
        let client_cfg = config("client");
        let server_cfg = config("node1");
        let offered = vec!["HMAC-SHA256".to_string()];

        let (client, server) = tokio::join!(
            initiate(Box::new(a) as BoxTransport, &client_cfg, None),
            accept(Box::new(b) as BoxTransport, &server_cfg, &offered, None),
        );
        let client = client.unwrap();
        let server = server.unwrap();

        assert_eq!(client.version, 1);
        assert_eq!(server.version, 1);
        assert_eq!(client.peer_name.as_deref(), Some("node1"));
        assert_eq!(server.peer_name.as_deref(), Some("client"));
        assert!(client.flags.authentication);
        assert!(!server.flags.authentication);
        assert_eq!(client.peer_caps.mechanisms, offered);
        assert!(client.flags.message_close);
    }

    #[tokio::test]
    async fn test_version_is_minimum() {
        let (a, b) = duplex(64 * 1024);
        let client_cfg = config("client");
        let mut server_cfg = config("server");
        // A future server that speaks up to version 9
        server_cfg.protocol_version = 9;

        let (client, server) = tokio::join!(
            initiate(Box::new(a) as BoxTransport, &client_cfg, None),
            accept(Box::new(b) as BoxTransport, &server_cfg, &[], None),
        );
        assert_eq!(client.unwrap().version, 1);
        assert_eq!(server.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_require_tls_without_upgrader_fails() {
        let (a, _b) = duplex(64 * 1024);
        let mut cfg = config("client");
        cfg.require_tls = true;

        let result = initiate(Box::new(a) as BoxTransport, &cfg, None).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Handshake(HandshakeError::NoTlsUpgrader))
        ));
    }

    #[tokio::test]
    async fn test_peer_disconnect_mid_handshake() {
        use tokio::io::AsyncReadExt;

        let (a, mut b) = duplex(64 * 1024);
        // A peer that swallows the greeting and vanishes
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = b.read(&mut buf).await;
        });

        let cfg = config("client");
        let result = initiate(Box::new(a) as BoxTransport, &cfg, None).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Handshake(HandshakeError::PeerClosed))
        ));
    }
}
