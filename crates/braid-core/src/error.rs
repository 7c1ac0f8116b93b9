//! Core error types for braid
//!
//! The taxonomy follows the blast radius of each failure: framing and
//! transport errors kill the connection, authentication failures are
//! retryable per mechanism until exhausted, channel errors kill only the
//! channel, and message errors kill only the message.

use braid_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

use crate::mechanism::MechanismError;
use crate::transform::TransformError;

/// Top-level error type for the braid ecosystem
#[derive(Error, Debug)]
pub enum BraidError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Channel open error
    #[error("Channel open error: {0}")]
    Open(#[from] OpenError),

    /// Message error
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors fatal to the whole connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Framing error from the wire
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Authentication failed terminally
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// A wrap/unwrap transform rejected a frame
    #[error("Security transform error: {0}")]
    Transform(#[from] TransformError),

    /// The connection is closed
    #[error("Connection closed")]
    Closed,

    /// Transport-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors during the greeting/capability phase
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// Peer disconnected mid-handshake
    #[error("Peer closed the connection during handshake")]
    PeerClosed,

    /// A frame arrived out of sequence
    #[error("Unexpected frame during handshake: type {0:#04x}")]
    UnexpectedFrame(u8),

    /// This side requires TLS but the peer did not offer it
    #[error("TLS required but peer does not support starttls")]
    TlsNotSupported,

    /// The peer requested TLS but no upgrader is installed
    #[error("Peer requested starttls but no TLS upgrader is configured")]
    NoTlsUpgrader,

    /// The negotiated version is unusable
    #[error("No common protocol version: peer maximum is {peer}, ours is {ours}")]
    VersionMismatch { peer: u8, ours: u8 },
}

/// Terminal authentication failures
#[derive(Error, Debug)]
pub enum AuthError {
    /// The peer offered no mechanisms at all
    #[error("Peer offered no authentication mechanisms")]
    NoMechanisms,

    /// Every candidate mechanism failed
    #[error("All authentication mechanisms failed: {}", format_failures(.failures))]
    Exhausted {
        /// Each attempted mechanism with its individual cause
        failures: Vec<(String, MechanismError)>,
    },

    /// The server gave up after too many failed attempts
    #[error("Authentication retry limit of {limit} exceeded")]
    RetriesExceeded { limit: u32 },

    /// A mechanism was requested that this side does not provide
    #[error("Unknown mechanism requested: {0}")]
    UnknownMechanism(String),

    /// The peer rejected authentication with a reason
    #[error("Rejected by peer: {0}")]
    Rejected(String),

    /// A frame arrived that has no place in the exchange
    #[error("Unexpected frame during authentication: type {0:#04x}")]
    UnexpectedFrame(u8),

    /// Peer disconnected mid-exchange
    #[error("Peer closed the connection during authentication")]
    PeerClosed,
}

fn format_failures(failures: &[(String, MechanismError)]) -> String {
    failures
        .iter()
        .map(|(name, cause)| format!("{name}: {cause}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors fatal to a single channel open, reported to the requester
#[derive(Error, Debug)]
pub enum OpenError {
    /// The responder has no service registered under the name
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// The responder's service refused or failed
    #[error("Service error: {0}")]
    ServiceError(String),

    /// The local channel limit is reached
    #[error("Too many open channels")]
    TooManyChannels,

    /// No free channel ID could be allocated
    #[error("Channel ID space exhausted")]
    IdsExhausted,

    /// The connection went away before the peer answered
    #[error("Connection closed before the open completed")]
    ConnectionClosed,
}

/// Errors fatal to a single message, leaving the channel running
#[derive(Error, Debug)]
pub enum MessageError {
    /// No window credit arrived within the ack timeout
    #[error("Window ack timeout: message cancelled")]
    AckTimeout,

    /// The message was cancelled
    #[error("Message cancelled")]
    Cancelled,

    /// The message exceeded its negotiated total size
    #[error("Message size limit of {limit} bytes exceeded")]
    SizeExceeded { limit: u64 },

    /// The per-direction in-flight message cap is reached
    #[error("Too many concurrent messages")]
    TooManyMessages,

    /// The channel closed underneath the message
    #[error("Channel closed")]
    ChannelClosed,

    /// The connection closed underneath the message
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
