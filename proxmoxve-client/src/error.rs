//! Error types for the Proxmox VE session client.

use thiserror::Error;

/// Errors that can occur while talking to the Proxmox VE API.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxmoxError {
    /// Credentials were rejected by the remote endpoint.
    #[error("Authentication failed for {user}: {message}")]
    Authentication { user: String, message: String },

    /// The endpoint could not be reached (network, TLS or timeout).
    #[error("Failed to connect to Proxmox API: {0}")]
    Connectivity(String),

    /// The node or VM addressed by a call does not exist.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Any other non-success response.
    #[error("API request {path} failed with status {status}: {message}")]
    Api {
        path: String,
        status: u16,
        message: String,
    },

    /// The response body did not have the expected shape.
    #[error("Invalid API response: {0}")]
    InvalidResponse(String),

    /// A call was made before any session was built.
    #[error("No session: build_session has not completed")]
    SessionNotBuilt,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxmoxError {
    pub fn auth(user: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            user: user.into(),
            message: message.into(),
        }
    }

    /// Short, stable identifier for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "authentication",
            Self::Connectivity(_) => "connectivity",
            Self::ResourceNotFound(_) => "resource_not_found",
            Self::Api { .. } => "api",
            Self::InvalidResponse(_) => "invalid_response",
            Self::SessionNotBuilt => "session_not_built",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<reqwest::Error> for ProxmoxError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            // connect, timeout, TLS and body transfer failures
            Self::Connectivity(e.to_string())
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ProxmoxError>;
