//! Identity collaborator.
//!
//! Credentials are checked upstream. The server only learns who a
//! connection belongs to when the socket opens.

use axum::http::{HeaderMap, HeaderName};

use queue_core::UserId;

/// Header an authenticating proxy sets for verified users.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Identity attached to a connection at open time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Authenticated user, if any.
    pub user_id: Option<UserId>,
    /// Whether the user id was verified.
    pub is_authenticated: bool,
}

impl Identity {
    /// An anonymous connection.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// An authenticated connection.
    #[must_use]
    pub fn user(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            is_authenticated: true,
        }
    }
}

/// Resolves a connection's identity from the upgrade request.
pub trait IdentityResolver: Send + Sync {
    /// Identity for a request with `headers`.
    fn resolve(&self, headers: &HeaderMap) -> Identity;
}

/// Trusts a user id header injected by a proxy in front of the server.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    header: HeaderName,
}

impl HeaderIdentity {
    /// Read the identity from `header`.
    #[must_use]
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Default for HeaderIdentity {
    fn default() -> Self {
        Self::new(HeaderName::from_static(USER_ID_HEADER))
    }
}

impl IdentityResolver for HeaderIdentity {
    fn resolve(&self, headers: &HeaderMap) -> Identity {
        headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map_or_else(Identity::anonymous, Identity::user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_missing_header_is_anonymous() {
        let identity = HeaderIdentity::default().resolve(&HeaderMap::new());
        assert_eq!(identity, Identity::anonymous());
        assert!(!identity.is_authenticated);
    }

    #[test]
    fn test_header_authenticates() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static(" user-42 "));
        let identity = HeaderIdentity::default().resolve(&headers);
        assert_eq!(identity, Identity::user("user-42"));
    }

    #[test]
    fn test_blank_header_is_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("   "));
        assert!(!HeaderIdentity::default().resolve(&headers).is_authenticated);
    }
}
