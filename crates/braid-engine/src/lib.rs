//! braid-engine: the braid wire protocol engine
//!
//! Drives one negotiated, authenticated, multiplexed connection over any
//! async byte stream: frame reassembly, handshake and capability
//! negotiation, challenge/response authentication, channel multiplexing
//! with a connection-wide close barrier, and per-message windowed flow
//! control with cancellation.
//!
//! The engine never interprets message payloads; channels are raw,
//! flow-controlled byte pipes for the layer above.
//!
//! # Example
//!
//! ```ignore
//! use braid_engine::Endpoint;
//! use braid_core::EngineConfig;
//!
//! let endpoint = Endpoint::new(EngineConfig::default());
//! let conn = endpoint.connect(tcp_stream).await?;
//! let channel = conn.open_channel("echo").await?;
//! let mut msg = channel.send_message()?;
//! msg.write("hello").await?;
//! msg.finish().await?;
//! ```

pub mod auth;
pub mod channel;
pub mod close;
pub mod connection;
pub mod handler;
pub mod handshake;
pub mod keepalive;
pub mod message;
pub mod pool;
pub mod writer;

pub use channel::Channel;
pub use connection::{Connection, Endpoint};
pub use handler::ConnectionEvent;
pub use handshake::PeerFlags;
pub use message::{IncomingMessage, MessageWriter};
pub use pool::{BufferPool, PooledBuf};
