//! Post-authentication frame transforms
//!
//! A mechanism that negotiates integrity or confidentiality installs one
//! of these on the connection; from then on every outgoing frame body is
//! wrapped and every incoming one unwrapped before parsing. The length
//! prefix itself stays in the clear so framing still works.

use thiserror::Error;

/// Errors from a wrap/unwrap transform. Always fatal to the connection.
#[derive(Error, Debug)]
pub enum TransformError {
    /// Integrity verification failed on an inbound frame
    #[error("Frame integrity check failed")]
    IntegrityFailure,

    /// The wrapped frame is too short to contain the security trailer
    #[error("Wrapped frame too short: {len} bytes")]
    TooShort { len: usize },
}

/// Wraps outgoing frame bodies and unwraps incoming ones.
pub trait FrameTransform: Send + Sync {
    /// Protect an outgoing frame body (type byte + payload).
    fn wrap(&self, body: &[u8]) -> Vec<u8>;

    /// Verify and strip the protection from an incoming frame body.
    fn unwrap(&self, body: &[u8]) -> Result<Vec<u8>, TransformError>;
}

/// HMAC-SHA256 integrity protection: each frame body is followed by a
/// 32-byte tag over the body under the negotiated session key.
pub struct HmacIntegrity {
    key: Vec<u8>,
}

impl HmacIntegrity {
    /// Tag length appended to every frame
    pub const TAG_LEN: usize = 32;

    /// Create a transform over the negotiated session key
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    fn tag(&self, body: &[u8]) -> [u8; Self::TAG_LEN] {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let mut mac =
            <Hmac<Sha256> as Mac>::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(body);
        mac.finalize().into_bytes().into()
    }
}

impl FrameTransform for HmacIntegrity {
    fn wrap(&self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + Self::TAG_LEN);
        out.extend_from_slice(body);
        out.extend_from_slice(&self.tag(body));
        out
    }

    fn unwrap(&self, body: &[u8]) -> Result<Vec<u8>, TransformError> {
        use subtle::ConstantTimeEq;

        if body.len() < Self::TAG_LEN {
            return Err(TransformError::TooShort { len: body.len() });
        }
        let (inner, received) = body.split_at(body.len() - Self::TAG_LEN);
        let expected = self.tag(inner);
        if expected.ct_eq(received).into() {
            Ok(inner.to_vec())
        } else {
            Err(TransformError::IntegrityFailure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let transform = HmacIntegrity::new(b"session key".to_vec());
        let body = b"\x30some frame body";
        let wrapped = transform.wrap(body);
        assert_eq!(wrapped.len(), body.len() + HmacIntegrity::TAG_LEN);
        assert_eq!(transform.unwrap(&wrapped).unwrap(), body);
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let transform = HmacIntegrity::new(b"session key".to_vec());
        let mut wrapped = transform.wrap(b"payload");
        wrapped[0] ^= 0x01;
        assert!(matches!(
            transform.unwrap(&wrapped),
            Err(TransformError::IntegrityFailure)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let wrapped = HmacIntegrity::new(b"key one".to_vec()).wrap(b"payload");
        let other = HmacIntegrity::new(b"key two".to_vec());
        assert!(other.unwrap(&wrapped).is_err());
    }

    #[test]
    fn test_short_frame_rejected() {
        let transform = HmacIntegrity::new(b"key".to_vec());
        assert!(matches!(
            transform.unwrap(&[1, 2, 3]),
            Err(TransformError::TooShort { len: 3 })
        ));
    }
}
