//! PLAIN mechanism
//!
//! Single-round `authzid NUL authcid NUL password`. Only sensible over a
//! confidential transport; the engine will happily run it regardless, that
//! judgement belongs to the host.

use std::sync::Arc;

use crate::identity::Identity;
use crate::mechanism::{ClientMechanism, MechanismError, ServerMechanism, ServerStep};

/// Mechanism name on the wire
pub const PLAIN: &str = "PLAIN";

/// Host-supplied credential check: authcid + password in, identity out.
pub type PlainVerifier =
    Arc<dyn Fn(&str, &str) -> Result<Identity, MechanismError> + Send + Sync>;

/// Client side of PLAIN.
pub struct PlainClient {
    authzid: String,
    authcid: String,
    password: String,
}

impl PlainClient {
    /// Authenticate as `authcid` with no separate authorization identity
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authzid: String::new(),
            authcid: authcid.into(),
            password: password.into(),
        }
    }

    /// Request a distinct authorization identity
    pub fn with_authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = authzid.into();
        self
    }
}

impl ClientMechanism for PlainClient {
    fn name(&self) -> &str {
        PLAIN
    }

    fn initial_response(&mut self) -> Result<Vec<u8>, MechanismError> {
        let mut out = Vec::with_capacity(
            self.authzid.len() + self.authcid.len() + self.password.len() + 2,
        );
        out.extend_from_slice(self.authzid.as_bytes());
        out.push(0);
        out.extend_from_slice(self.authcid.as_bytes());
        out.push(0);
        out.extend_from_slice(self.password.as_bytes());
        Ok(out)
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        Err(MechanismError::Malformed(
            "PLAIN expects no challenge".to_string(),
        ))
    }
}

/// Server side of PLAIN.
pub struct PlainServer {
    verifier: PlainVerifier,
}

impl PlainServer {
    /// Create a server that checks credentials with the given verifier
    pub fn new(verifier: PlainVerifier) -> Self {
        Self { verifier }
    }
}

impl ServerMechanism for PlainServer {
    fn name(&self) -> &str {
        PLAIN
    }

    fn evaluate_response(&mut self, response: &[u8]) -> Result<ServerStep, MechanismError> {
        let text = std::str::from_utf8(response)
            .map_err(|_| MechanismError::Malformed("PLAIN response is not UTF-8".to_string()))?;
        let mut parts = text.splitn(3, '\0');
        let (authzid, authcid, password) = match (parts.next(), parts.next(), parts.next()) {
            (Some(z), Some(c), Some(p)) => (z, c, p),
            _ => {
                return Err(MechanismError::Malformed(
                    "PLAIN response must have three NUL-separated parts".to_string(),
                ));
            }
        };

        let identity = (self.verifier)(authcid, password)?;
        let identity = if authzid.is_empty() {
            identity
        } else {
            Identity::new(authzid)
        };
        Ok(ServerStep::Complete {
            identity,
            final_data: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subtle::ConstantTimeEq;

    fn verifier() -> PlainVerifier {
        Arc::new(|user, pass| {
            let ok = user == "joe" && bool::from(pass.as_bytes().ct_eq(b"secret"));
            if ok {
                Ok(Identity::new(user))
            } else {
                Err(MechanismError::BadCredentials(
                    "bad username or password".to_string(),
                ))
            }
        })
    }

    #[test]
    fn test_plain_success() {
        let mut client = PlainClient::new("joe", "secret");
        let mut server = PlainServer::new(verifier());

        let initial = client.initial_response().unwrap();
        match server.evaluate_response(&initial).unwrap() {
            ServerStep::Complete { identity, .. } => assert_eq!(identity.name(), "joe"),
            ServerStep::Challenge(_) => panic!("Expected completion"),
        }
    }

    #[test]
    fn test_plain_bad_password() {
        let mut client = PlainClient::new("joe", "wrong");
        let mut server = PlainServer::new(verifier());

        let initial = client.initial_response().unwrap();
        assert!(matches!(
            server.evaluate_response(&initial),
            Err(MechanismError::BadCredentials(_))
        ));
    }

    #[test]
    fn test_plain_authzid_overrides() {
        let mut client = PlainClient::new("joe", "secret").with_authzid("admin");
        let mut server = PlainServer::new(verifier());

        let initial = client.initial_response().unwrap();
        match server.evaluate_response(&initial).unwrap() {
            ServerStep::Complete { identity, .. } => assert_eq!(identity.name(), "admin"),
            ServerStep::Challenge(_) => panic!("Expected completion"),
        }
    }

    #[test]
    fn test_plain_malformed() {
        let mut server = PlainServer::new(verifier());
        assert!(matches!(
            server.evaluate_response(b"no separators"),
            Err(MechanismError::Malformed(_))
        ));
    }
}
