//! Byte-stream abstraction
//!
//! The engine runs over anything that reads and writes bytes
//! asynchronously. TLS and socket setup belong to the host; the engine
//! only needs a hook to swap the stream mid-handshake when starttls is
//! negotiated.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any async byte stream the engine can drive.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// A boxed transport, as handed to and returned by the TLS upgrader.
pub type BoxTransport = Box<dyn Transport>;

/// Host-supplied mid-stream TLS upgrade.
///
/// Invoked after the starttls/starttls-ack exchange, before any further
/// frames are read or written. The upgrader owns the actual TLS stack.
#[async_trait]
pub trait TlsUpgrader: Send + Sync {
    /// Wrap the plaintext stream in TLS.
    async fn upgrade(&self, stream: BoxTransport) -> std::io::Result<BoxTransport>;
}
