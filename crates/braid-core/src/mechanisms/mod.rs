//! Built-in authentication mechanisms
//!
//! Hosts can register anything implementing the mechanism traits; these
//! three cover the common cases: no authentication, username/password
//! against a host verifier, and a salted challenge/response with optional
//! integrity protection.

mod anonymous;
mod hmac_sha256;
mod plain;

pub use anonymous::{Anonymous, ANONYMOUS};
pub use hmac_sha256::{HmacSha256Client, HmacSha256Server, SecretProvider, HMAC_SHA256};
pub use plain::{PlainClient, PlainServer, PlainVerifier, PLAIN};
