//! The four-field bundle of credentials needed to dial the relay.

use crate::error::{Error, Result};
use crate::relay::relay_uri;

/// An immutable, validated bundle of session credentials.
///
/// Constructed either directly or by [`crate::discovery::Discovery::resolve`].
/// All four fields must be non-empty; [`Connection::new`] is the only way to
/// obtain one, so a `Connection` in hand is always valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    session_id: String,
    session_token: String,
    relay_sas: String,
    relay_endpoint: String,
}

impl Connection {
    /// Validate and construct a `Connection`.
    ///
    /// Fails with [`Error::InvalidConnection`] naming the first empty field,
    /// checked in field-declaration order.
    pub fn new(
        session_id: impl Into<String>,
        session_token: impl Into<String>,
        relay_sas: impl Into<String>,
        relay_endpoint: impl Into<String>,
    ) -> Result<Self> {
        let session_id = session_id.into();
        let session_token = session_token.into();
        let relay_sas = relay_sas.into();
        let relay_endpoint = relay_endpoint.into();

        if session_id.is_empty() {
            return Err(Error::InvalidConnection { field: "sessionID" });
        }
        if session_token.is_empty() {
            return Err(Error::InvalidConnection { field: "sessionToken" });
        }
        if relay_sas.is_empty() {
            return Err(Error::InvalidConnection { field: "relaySAS" });
        }
        if relay_endpoint.is_empty() {
            return Err(Error::InvalidConnection { field: "relayEndpoint" });
        }

        Ok(Self {
            session_id,
            session_token,
            relay_sas,
            relay_endpoint,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn relay_sas(&self) -> &str {
        &self.relay_sas
    }

    pub fn relay_endpoint(&self) -> &str {
        &self.relay_endpoint
    }

    /// Derive the relay WebSocket URL for a given hybrid-connection `action`
    /// (e.g. `"connect"`). Delegates to [`relay_uri`].
    pub fn uri(&self, action: &str) -> Result<String> {
        relay_uri(&self.relay_endpoint, action, &self.relay_sas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_any_empty_field() {
        assert!(Connection::new("", "t", "sas", "e").is_err());
        assert!(Connection::new("s", "", "sas", "e").is_err());
        assert!(Connection::new("s", "t", "", "e").is_err());
        assert!(Connection::new("s", "t", "sas", "").is_err());
    }

    #[test]
    fn names_the_first_empty_field() {
        let err = Connection::new("s", "t", "", "e").unwrap_err();
        match err {
            Error::InvalidConnection { field } => assert_eq!(field, "relaySAS"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn accepts_all_fields_present() {
        let conn = Connection::new("s", "t", "sas", "sb://host.net/path/").unwrap();
        assert_eq!(conn.session_id(), "s");
        assert_eq!(conn.relay_endpoint(), "sb://host.net/path/");
    }

    #[test]
    fn uri_delegates_to_relay_module() {
        let conn = Connection::new("s", "t", "sas", "sb://host.net/path/").unwrap();
        let uri = conn.uri("connect").unwrap();
        assert!(uri.starts_with("wss://host.net:443/$hc/path/"));
    }
}
