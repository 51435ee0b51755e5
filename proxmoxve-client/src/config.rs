//! Connection parameters for a Proxmox VE endpoint.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default port of the Proxmox VE API.
pub const DEFAULT_PORT: u16 = 8006;

/// Default authentication realm (Linux PAM).
pub const DEFAULT_REALM: &str = "pam";

/// Connection parameters. Immutable once handed to a [`crate::SessionClient`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Hostname or IP address of the API endpoint
    pub host: String,
    /// API port
    pub port: u16,
    /// User name, with or without a `@realm` suffix
    pub username: String,
    /// Realm appended when `username` carries none
    pub realm: String,
    /// Password for the user
    pub password: String,
    /// Verify the server certificate
    pub verify_tls: bool,
}

impl ConnectionConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        realm: impl Into<String>,
        password: impl Into<String>,
        verify_tls: bool,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            realm: realm.into(),
            password: password.into(),
            verify_tls,
        }
    }

    /// User identifier sent at login.
    ///
    /// A username that already contains `@` is used as-is; otherwise the
    /// configured realm is appended.
    pub fn user_id(&self) -> String {
        if self.username.contains('@') {
            self.username.clone()
        } else {
            format!("{}@{}", self.username, self.realm)
        }
    }

    /// `host:port`, used to identify the endpoint in logs and errors.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL of the JSON API.
    pub fn api_base_url(&self) -> String {
        // bare IPv6 literals need brackets inside a URL
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("https://{}:{}/api2/json", host, self.port)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("realm", &self.realm)
            .field("password", &"<redacted>")
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}
