//! Channel open routing
//!
//! When a channel-open request arrives, the engine asks the host's
//! acceptor whether the named service exists and what limits it is
//! configured with. Service discovery proper is out of scope; the
//! [`ServiceMap`] here is just the minimal registry a host or test needs
//! to answer open requests.

use dashmap::DashMap;

use braid_protocol::ChannelParams;

/// Outcome of asking the acceptor about an open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    /// The service exists; these are its configured limits, expressed from
    /// the responder's point of view
    Accept(ChannelParams),
    /// No service under that name
    NotFound(String),
    /// The service exists but refused or failed
    Error(String),
}

/// Routes channel-open requests by service name.
pub trait ChannelAcceptor: Send + Sync {
    /// Decide whether to accept an open request for `service`.
    fn decide(&self, service: &str, requested: &ChannelParams) -> OpenDecision;
}

/// A name → configured-limits map, sufficient for most hosts.
#[derive(Debug, Default)]
pub struct ServiceMap {
    services: DashMap<String, ChannelParams>,
}

impl ServiceMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service with the given configured limits
    pub fn register(&self, name: impl Into<String>, params: ChannelParams) {
        self.services.insert(name.into(), params);
    }

    /// Remove a service; open requests for it will refuse afterwards
    pub fn unregister(&self, name: &str) {
        self.services.remove(name);
    }
}

impl ChannelAcceptor for ServiceMap {
    fn decide(&self, service: &str, _requested: &ChannelParams) -> OpenDecision {
        match self.services.get(service) {
            Some(entry) => OpenDecision::Accept(*entry.value()),
            None => OpenDecision::NotFound(format!("no such service: {service}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_service_accepts() {
        let map = ServiceMap::new();
        map.register("echo", ChannelParams::default());

        let decision = map.decide("echo", &ChannelParams::default());
        assert_eq!(decision, OpenDecision::Accept(ChannelParams::default()));
    }

    #[test]
    fn test_unknown_service_refuses() {
        let map = ServiceMap::new();
        match map.decide("missing", &ChannelParams::default()) {
            OpenDecision::NotFound(reason) => assert!(reason.contains("missing")),
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_unregister() {
        let map = ServiceMap::new();
        map.register("echo", ChannelParams::default());
        map.unregister("echo");
        assert!(matches!(
            map.decide("echo", &ChannelParams::default()),
            OpenDecision::NotFound(_)
        ));
    }
}
