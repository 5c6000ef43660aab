//! Request authentication.
//!
//! The backend accepts bearer tokens; anonymous access works against
//! local development servers.

/// Credentials attached to every HTTP request and to the WebSocket
/// upgrade.
#[derive(Debug, Clone)]
pub enum Auth {
    /// No authentication, for local development.
    None,
    /// Bearer token.
    Bearer(String),
}

impl Auth {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }

    pub fn none() -> Self {
        Self::None
    }

    /// Attach the Authorization header to an HTTP request builder.
    pub fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::None => builder,
            Self::Bearer(token) => builder.bearer_auth(token),
        }
    }

    /// Header value for the WebSocket upgrade request, if any.
    pub fn header_value(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Bearer(token) => Some(format!("Bearer {token}")),
        }
    }
}

impl From<Option<String>> for Auth {
    fn from(token: Option<String>) -> Self {
        match token {
            Some(token) if !token.is_empty() => Self::Bearer(token),
            _ => Self::None,
        }
    }
}
