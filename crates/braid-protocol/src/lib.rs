//! braid-protocol: Wire protocol for braid connection multiplexing
//!
//! This crate defines the binary protocol carried over a braid connection:
//! length-prefixed frames, the capability exchange, channel parameter
//! negotiation, and the per-message data framing.

pub mod caps;
pub mod codec;
pub mod error;
pub mod fields;
pub mod frame;
pub mod ids;
pub mod params;

pub use caps::Capabilities;
pub use codec::{LengthCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use frame::{Frame, FrameKind, MessageFlags};
pub use ids::{ChannelId, MessageId};
pub use params::ChannelParams;

/// Highest protocol version this implementation speaks.
///
/// Both peers advertise their maximum in the capability exchange and the
/// connection runs at the minimum of the two.
pub const PROTOCOL_VERSION: u8 = 1;

/// Human-readable version string advertised alongside the numeric version.
pub const VERSION_STRING: &str = concat!("braid-", env!("CARGO_PKG_VERSION"));

/// Default per-message window size in bytes (16 KiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 16 * 1024;

/// Default maximum in-flight messages per channel direction.
pub const DEFAULT_MAX_MESSAGES: u16 = 80;

/// Default maximum concurrent channels per direction.
pub const DEFAULT_MAX_CHANNELS: u16 = 24;

/// Default maximum total message size (effectively unlimited).
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = u64::MAX;
