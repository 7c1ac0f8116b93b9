//! Pluggable challenge/response authentication
//!
//! A mechanism is a named challenge/response algorithm. The client side
//! produces an initial response and then answers challenges; the server
//! side consumes responses and either issues another challenge, completes
//! with an identity, or fails. Evaluation is synchronous by design: the
//! engine hands rounds off to a blocking worker so a slow mechanism never
//! stalls the connection's framing layer.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::identity::Identity;
use crate::transform::FrameTransform;

/// Errors a mechanism can produce during a round.
///
/// These are recoverable at the negotiation layer: the client records the
/// failure and moves on to the next candidate mechanism.
#[derive(Error, Debug)]
pub enum MechanismError {
    /// The peer's credentials did not verify
    #[error("Authentication failed: {0}")]
    BadCredentials(String),

    /// A challenge or response was malformed
    #[error("Malformed exchange: {0}")]
    Malformed(String),

    /// The peer rejected this mechanism
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The mechanism cannot run in this configuration
    #[error("Mechanism unavailable: {0}")]
    Unavailable(String),
}

/// Security properties a completed mechanism negotiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityLayer {
    /// Frames are integrity-protected after authentication
    pub integrity: bool,
    /// Frames are encrypted after authentication
    pub confidentiality: bool,
}

impl SecurityLayer {
    /// No protection; frames stay in the clear
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether a wrap/unwrap transform must be installed
    pub fn wraps_frames(&self) -> bool {
        self.integrity || self.confidentiality
    }
}

/// Client side of one mechanism exchange.
pub trait ClientMechanism: Send + 'static {
    /// Mechanism name as advertised on the wire
    fn name(&self) -> &str;

    /// The response sent along with the initial auth request
    fn initial_response(&mut self) -> Result<Vec<u8>, MechanismError>;

    /// Answer one server challenge
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError>;

    /// Verify the final data the server sent with completion
    fn verify_complete(&mut self, data: &[u8]) -> Result<(), MechanismError> {
        let _ = data;
        Ok(())
    }

    /// Security properties established by this exchange
    fn security_layer(&self) -> SecurityLayer {
        SecurityLayer::none()
    }

    /// The frame transform to install when the layer wraps frames
    fn into_transform(self: Box<Self>) -> Option<Box<dyn FrameTransform>> {
        None
    }
}

/// Outcome of one server-side evaluation round.
pub enum ServerStep {
    /// Send this challenge and wait for the next response
    Challenge(Vec<u8>),
    /// The exchange succeeded
    Complete {
        /// Authenticated identity
        identity: Identity,
        /// Final data for the client, possibly empty
        final_data: Vec<u8>,
    },
}

/// Server side of one mechanism exchange.
pub trait ServerMechanism: Send + 'static {
    /// Mechanism name as advertised on the wire
    fn name(&self) -> &str;

    /// Evaluate the client's latest response (the initial response on the
    /// first round)
    fn evaluate_response(&mut self, response: &[u8]) -> Result<ServerStep, MechanismError>;

    /// Security properties established by this exchange
    fn security_layer(&self) -> SecurityLayer {
        SecurityLayer::none()
    }

    /// The frame transform to install when the layer wraps frames
    fn into_transform(self: Box<Self>) -> Option<Box<dyn FrameTransform>> {
        None
    }
}

/// Policy choosing which offered mechanism to try next.
///
/// Called with the candidate names that have not failed yet, in the
/// server's preference order; returning `None` abandons authentication.
pub type MechanismSelector = Arc<dyn Fn(&[String]) -> Option<String> + Send + Sync>;

type ClientFactory = Arc<dyn Fn() -> Box<dyn ClientMechanism> + Send + Sync>;
type ServerFactory = Arc<dyn Fn() -> Box<dyn ServerMechanism> + Send + Sync>;

/// The set of mechanisms one endpoint is willing to run.
///
/// Insertion order is preference order; it drives both the offered list in
/// the capability exchange and the default client selection policy.
#[derive(Clone, Default)]
pub struct MechanismCatalog {
    order: Vec<String>,
    clients: HashMap<String, ClientFactory>,
    servers: HashMap<String, ServerFactory>,
}

impl MechanismCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client-side mechanism factory
    pub fn register_client<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn ClientMechanism> + Send + Sync + 'static,
    {
        let name = name.into();
        if !self.order.contains(&name) {
            self.order.push(name.clone());
        }
        self.clients.insert(name, Arc::new(factory));
        self
    }

    /// Register a server-side mechanism factory
    pub fn register_server<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn ServerMechanism> + Send + Sync + 'static,
    {
        let name = name.into();
        if !self.order.contains(&name) {
            self.order.push(name.clone());
        }
        self.servers.insert(name, Arc::new(factory));
        self
    }

    /// Mechanism names offered to peers, in preference order
    pub fn offered(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.servers.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Names this side can run as a client, in preference order
    pub fn client_names(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.clients.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Instantiate the client side of a named mechanism
    pub fn create_client(&self, name: &str) -> Option<Box<dyn ClientMechanism>> {
        self.clients.get(name).map(|f| f())
    }

    /// Instantiate the server side of a named mechanism
    pub fn create_server(&self, name: &str) -> Option<Box<dyn ServerMechanism>> {
        self.servers.get(name).map(|f| f())
    }

    /// Whether any mechanism is registered at all
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl std::fmt::Debug for MechanismCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MechanismCatalog")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanisms::Anonymous;

    #[test]
    fn test_catalog_order_is_preference_order() {
        let mut catalog = MechanismCatalog::new();
        catalog.register_server("B", || Box::new(Anonymous::server()));
        catalog.register_server("A", || Box::new(Anonymous::server()));
        assert_eq!(catalog.offered(), vec!["B".to_string(), "A".to_string()]);
    }

    #[test]
    fn test_create_unknown_is_none() {
        let catalog = MechanismCatalog::new();
        assert!(catalog.create_server("NOPE").is_none());
        assert!(catalog.create_client("NOPE").is_none());
    }

    #[test]
    fn test_client_and_server_sides_tracked_separately() {
        let mut catalog = MechanismCatalog::new();
        catalog.register_client("ANONYMOUS", || Box::new(Anonymous::client()));
        assert!(catalog.offered().is_empty());
        assert_eq!(catalog.client_names(), vec!["ANONYMOUS".to_string()]);
    }
}
