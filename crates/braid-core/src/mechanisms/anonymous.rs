//! ANONYMOUS mechanism
//!
//! Completes in a single round with the well-known anonymous identity.
//! The optional trace string travels in the initial response and is only
//! ever logged.

use crate::identity::Identity;
use crate::mechanism::{ClientMechanism, MechanismError, ServerMechanism, ServerStep};

/// Mechanism name on the wire
pub const ANONYMOUS: &str = "ANONYMOUS";

/// The ANONYMOUS mechanism, usable on either side.
#[derive(Debug, Default)]
pub struct Anonymous {
    trace: Option<String>,
}

impl Anonymous {
    /// Client side
    pub fn client() -> Self {
        Self::default()
    }

    /// Client side with a trace string for the server's logs
    pub fn client_with_trace(trace: impl Into<String>) -> Self {
        Self {
            trace: Some(trace.into()),
        }
    }

    /// Server side
    pub fn server() -> Self {
        Self::default()
    }
}

impl ClientMechanism for Anonymous {
    fn name(&self) -> &str {
        ANONYMOUS
    }

    fn initial_response(&mut self) -> Result<Vec<u8>, MechanismError> {
        Ok(self
            .trace
            .as_deref()
            .map(|t| t.as_bytes().to_vec())
            .unwrap_or_default())
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        Err(MechanismError::Malformed(
            "ANONYMOUS expects no challenge".to_string(),
        ))
    }
}

impl ServerMechanism for Anonymous {
    fn name(&self) -> &str {
        ANONYMOUS
    }

    fn evaluate_response(&mut self, response: &[u8]) -> Result<ServerStep, MechanismError> {
        if !response.is_empty() {
            if let Ok(trace) = std::str::from_utf8(response) {
                tracing::debug!("Anonymous authentication, trace: {}", trace);
            }
        }
        Ok(ServerStep::Complete {
            identity: Identity::anonymous(),
            final_data: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_round_completion() {
        let mut client = Anonymous::client_with_trace("test@local");
        let mut server = Anonymous::server();

        let initial = client.initial_response().unwrap();
        match server.evaluate_response(&initial).unwrap() {
            ServerStep::Complete { identity, .. } => {
                assert_eq!(identity, Identity::anonymous());
            }
            ServerStep::Challenge(_) => panic!("Expected completion"),
        }
    }

    #[test]
    fn test_client_rejects_challenge() {
        let mut client = Anonymous::client();
        assert!(client.evaluate_challenge(b"?").is_err());
    }
}
