//! Authenticated peer identity

use std::fmt;

/// The identity a successful authentication exchange produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Authorization name, as established by the mechanism
    name: String,
}

impl Identity {
    /// Create an identity from an authorization name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The well-known anonymous identity
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    /// The authorization name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
