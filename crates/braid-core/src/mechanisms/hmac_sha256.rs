//! HMAC-SHA256 challenge/response mechanism
//!
//! Two challenge/response rounds:
//!
//! 1. Client sends its username as the initial response. The server
//!    challenges with a 32-byte random nonce; the client answers with
//!    `hex(HMAC(password, nonce || username))`.
//! 2. The server verifies the proof and challenges back with its own
//!    mutual proof `hex(HMAC(password, "server-proof" || nonce))`; the
//!    client verifies it and answers with an empty response.
//!
//! When both sides were constructed with integrity enabled, completion
//! installs an [`HmacIntegrity`] transform keyed by
//! `HMAC(password, "session-key" || nonce)`.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::identity::Identity;
use crate::mechanism::{
    ClientMechanism, MechanismError, SecurityLayer, ServerMechanism, ServerStep,
};
use crate::transform::{FrameTransform, HmacIntegrity};

/// Mechanism name on the wire
pub const HMAC_SHA256: &str = "HMAC-SHA256";

/// Host-supplied password lookup by username.
pub type SecretProvider = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

const NONCE_LEN: usize = 32;
const SERVER_PROOF_CONTEXT: &[u8] = b"server-proof";
const SESSION_KEY_CONTEXT: &[u8] = b"session-key";

fn hmac_tag(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn client_proof(password: &str, nonce: &[u8], username: &str) -> String {
    hex::encode(hmac_tag(password.as_bytes(), &[nonce, username.as_bytes()]))
}

fn server_proof(password: &str, nonce: &[u8]) -> String {
    hex::encode(hmac_tag(password.as_bytes(), &[SERVER_PROOF_CONTEXT, nonce]))
}

fn session_key(password: &str, nonce: &[u8]) -> Vec<u8> {
    hmac_tag(password.as_bytes(), &[SESSION_KEY_CONTEXT, nonce]).to_vec()
}

enum ClientState {
    Start,
    AwaitProof { nonce: Vec<u8> },
    Done { nonce: Vec<u8> },
}

/// Client side of HMAC-SHA256.
pub struct HmacSha256Client {
    username: String,
    password: String,
    integrity: bool,
    state: ClientState,
}

impl HmacSha256Client {
    /// Authenticate as `username` with `password`
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            integrity: false,
            state: ClientState::Start,
        }
    }

    /// Request integrity protection for all post-auth frames
    pub fn with_integrity(mut self) -> Self {
        self.integrity = true;
        self
    }
}

impl ClientMechanism for HmacSha256Client {
    fn name(&self) -> &str {
        HMAC_SHA256
    }

    fn initial_response(&mut self) -> Result<Vec<u8>, MechanismError> {
        Ok(self.username.as_bytes().to_vec())
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        match std::mem::replace(&mut self.state, ClientState::Start) {
            ClientState::Start => {
                if challenge.len() != NONCE_LEN {
                    return Err(MechanismError::Malformed(format!(
                        "expected {NONCE_LEN}-byte nonce, got {}",
                        challenge.len()
                    )));
                }
                let nonce = challenge.to_vec();
                let proof = client_proof(&self.password, &nonce, &self.username);
                self.state = ClientState::AwaitProof { nonce };
                Ok(proof.into_bytes())
            }
            ClientState::AwaitProof { nonce } => {
                let expected = server_proof(&self.password, &nonce);
                if !bool::from(expected.as_bytes().ct_eq(challenge)) {
                    return Err(MechanismError::BadCredentials(
                        "server proof did not verify".to_string(),
                    ));
                }
                self.state = ClientState::Done { nonce };
                Ok(Vec::new())
            }
            ClientState::Done { nonce } => {
                self.state = ClientState::Done { nonce };
                Err(MechanismError::Malformed(
                    "challenge after completion".to_string(),
                ))
            }
        }
    }

    fn security_layer(&self) -> SecurityLayer {
        SecurityLayer {
            integrity: self.integrity,
            confidentiality: false,
        }
    }

    fn into_transform(self: Box<Self>) -> Option<Box<dyn FrameTransform>> {
        if !self.integrity {
            return None;
        }
        match &self.state {
            ClientState::Done { nonce } => Some(Box::new(HmacIntegrity::new(session_key(
                &self.password,
                nonce,
            )))),
            _ => None,
        }
    }
}

enum ServerState {
    Start,
    AwaitProof {
        username: String,
        password: String,
        nonce: Vec<u8>,
    },
    AwaitFinal {
        username: String,
        password: String,
        nonce: Vec<u8>,
    },
    Done {
        password: String,
        nonce: Vec<u8>,
    },
}

/// Server side of HMAC-SHA256.
pub struct HmacSha256Server {
    secrets: SecretProvider,
    integrity: bool,
    state: ServerState,
}

impl HmacSha256Server {
    /// Create a server that looks up passwords with the given provider
    pub fn new(secrets: SecretProvider) -> Self {
        Self {
            secrets,
            integrity: false,
            state: ServerState::Start,
        }
    }

    /// Require integrity protection for all post-auth frames
    pub fn with_integrity(mut self) -> Self {
        self.integrity = true;
        self
    }
}

impl ServerMechanism for HmacSha256Server {
    fn name(&self) -> &str {
        HMAC_SHA256
    }

    fn evaluate_response(&mut self, response: &[u8]) -> Result<ServerStep, MechanismError> {
        match std::mem::replace(&mut self.state, ServerState::Start) {
            ServerState::Start => {
                let username = std::str::from_utf8(response)
                    .map_err(|_| {
                        MechanismError::Malformed("username is not UTF-8".to_string())
                    })?
                    .to_owned();
                let Some(password) = (self.secrets)(&username) else {
                    return Err(MechanismError::BadCredentials(format!(
                        "unknown user: {username}"
                    )));
                };
                let mut nonce = vec![0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                let challenge = nonce.clone();
                self.state = ServerState::AwaitProof {
                    username,
                    password,
                    nonce,
                };
                Ok(ServerStep::Challenge(challenge))
            }
            ServerState::AwaitProof {
                username,
                password,
                nonce,
            } => {
                let expected = client_proof(&password, &nonce, &username);
                if !bool::from(expected.as_bytes().ct_eq(response)) {
                    return Err(MechanismError::BadCredentials(
                        "client proof did not verify".to_string(),
                    ));
                }
                let proof = server_proof(&password, &nonce);
                self.state = ServerState::AwaitFinal {
                    username,
                    password,
                    nonce,
                };
                Ok(ServerStep::Challenge(proof.into_bytes()))
            }
            ServerState::AwaitFinal {
                username,
                password,
                nonce,
            } => {
                if !response.is_empty() {
                    return Err(MechanismError::Malformed(
                        "expected empty final response".to_string(),
                    ));
                }
                self.state = ServerState::Done { password, nonce };
                Ok(ServerStep::Complete {
                    identity: Identity::new(username),
                    final_data: Vec::new(),
                })
            }
            done @ ServerState::Done { .. } => {
                self.state = done;
                Err(MechanismError::Malformed(
                    "response after completion".to_string(),
                ))
            }
        }
    }

    fn security_layer(&self) -> SecurityLayer {
        SecurityLayer {
            integrity: self.integrity,
            confidentiality: false,
        }
    }

    fn into_transform(self: Box<Self>) -> Option<Box<dyn FrameTransform>> {
        if !self.integrity {
            return None;
        }
        match &self.state {
            ServerState::Done { password, nonce } => Some(Box::new(HmacIntegrity::new(
                session_key(password, nonce),
            ))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> SecretProvider {
        Arc::new(|user| (user == "joe").then(|| "secret".to_string()))
    }

    /// Drive a full client/server exchange in memory, returning the
    /// identity and both finished mechanisms.
    fn run_exchange(
        mut client: HmacSha256Client,
        mut server: HmacSha256Server,
    ) -> Result<(Identity, HmacSha256Client, HmacSha256Server), MechanismError> {
        let mut response = client.initial_response()?;
        let mut rounds = 0;
        loop {
            match server.evaluate_response(&response)? {
                ServerStep::Challenge(challenge) => {
                    response = client.evaluate_challenge(&challenge)?;
                }
                ServerStep::Complete { identity, .. } => {
                    assert_eq!(rounds, 2, "expected exactly two challenge rounds");
                    return Ok((identity, client, server));
                }
            }
            rounds += 1;
        }
    }

    #[test]
    fn test_two_round_success() {
        let (identity, _, _) = run_exchange(
            HmacSha256Client::new("joe", "secret"),
            HmacSha256Server::new(secrets()),
        )
        .unwrap();
        assert_eq!(identity.name(), "joe");
    }

    #[test]
    fn test_wrong_password_fails_on_proof() {
        let result = run_exchange(
            HmacSha256Client::new("joe", "wrong"),
            HmacSha256Server::new(secrets()),
        );
        assert!(matches!(result, Err(MechanismError::BadCredentials(_))));
    }

    #[test]
    fn test_unknown_user_fails_immediately() {
        let mut server = HmacSha256Server::new(secrets());
        assert!(matches!(
            server.evaluate_response(b"nobody"),
            Err(MechanismError::BadCredentials(_))
        ));
    }

    #[test]
    fn test_integrity_transforms_agree() {
        let (_, client, server) = run_exchange(
            HmacSha256Client::new("joe", "secret").with_integrity(),
            HmacSha256Server::new(secrets()).with_integrity(),
        )
        .unwrap();

        let client_transform = Box::new(client).into_transform().unwrap();
        let server_transform = Box::new(server).into_transform().unwrap();

        let wrapped = client_transform.wrap(b"frame body");
        assert_eq!(server_transform.unwrap(&wrapped).unwrap(), b"frame body");
    }

    #[test]
    fn test_no_transform_without_integrity() {
        let (_, client, _) = run_exchange(
            HmacSha256Client::new("joe", "secret"),
            HmacSha256Server::new(secrets()),
        )
        .unwrap();
        assert!(Box::new(client).into_transform().is_none());
    }
}
