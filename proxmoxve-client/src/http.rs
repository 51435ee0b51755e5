//! Proxmox VE REST backend with ticket-based authentication.
//!
//! Login posts the credentials to `/access/ticket`; the returned ticket is
//! sent as the `PVEAuthCookie` cookie on every call and the CSRF token as a
//! header on writes. All responses wrap their payload in `{"data": ...}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::ConnectionConfig;
use crate::error::{ProxmoxError, Result};
use crate::traits::{ApiSession, Connector};

/// Per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const CSRF_HEADER: &str = "CSRFPreventionToken";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

/// Connector for a live Proxmox VE endpoint.
pub struct HttpConnector {
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for HttpConnector {
    #[instrument(skip(self, config), fields(endpoint = %config.endpoint()))]
    async fn connect(&self, config: &ConnectionConfig, user_id: &str) -> Result<Arc<dyn ApiSession>> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ProxmoxError::Connectivity(format!("Failed to build HTTP client: {e}")))?;

        let base_url = config.api_base_url();
        let url = format!("{}/access/ticket", base_url);

        let resp = client
            .post(&url)
            .form(&[("username", user_id), ("password", config.password.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProxmoxError::auth(user_id, "authentication failure"));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(error_for_status("/access/ticket", status, &body));
        }

        let envelope: Envelope<TicketData> = resp.json().await.map_err(|e| {
            ProxmoxError::InvalidResponse(format!("Failed to parse ticket response: {e}"))
        })?;
        // a rejected login may still answer 200 with a null payload
        let ticket = envelope
            .data
            .ok_or_else(|| ProxmoxError::auth(user_id, "no ticket issued"))?;

        debug!(user = %user_id, "Ticket acquired");
        Ok(Arc::new(HttpSession {
            client,
            base_url,
            ticket: ticket.ticket,
            csrf_token: ticket.csrf_token,
        }))
    }
}

/// Session holding a ticket for one user.
struct HttpSession {
    client: Client,
    base_url: String,
    ticket: String,
    csrf_token: String,
}

impl HttpSession {
    fn cookie(&self) -> String {
        format!("PVEAuthCookie={}", self.ticket)
    }

    async fn read_data(path: &str, resp: Response) -> Result<Value> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(error_for_status(path, status, &body));
        }

        let envelope: Envelope<Value> = resp.json().await.map_err(|e| {
            ProxmoxError::InvalidResponse(format!("{path}: {e}"))
        })?;
        Ok(envelope.data.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ApiSession for HttpSession {
    async fn get(&self, path: &str) -> Result<Value> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header(header::COOKIE, self.cookie())
            .send()
            .await?;
        Self::read_data(path, resp).await
    }

    async fn post(&self, path: &str) -> Result<Value> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(header::COOKIE, self.cookie())
            .header(CSRF_HEADER, self.csrf_token.as_str())
            .send()
            .await?;
        Self::read_data(path, resp).await
    }
}

/// Map a non-success response onto the error taxonomy.
///
/// The API reports missing guests as `500 ... does not exist` rather than 404.
fn error_for_status(path: &str, status: StatusCode, body: &str) -> ProxmoxError {
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("no reason").to_string()
    } else {
        body.trim().to_string()
    };

    match status {
        StatusCode::UNAUTHORIZED => ProxmoxError::auth("session", format!("{path}: {message}")),
        StatusCode::NOT_FOUND => ProxmoxError::ResourceNotFound(format!("{path}: {message}")),
        StatusCode::INTERNAL_SERVER_ERROR if message.contains("does not exist") => {
            ProxmoxError::ResourceNotFound(format!("{path}: {message}"))
        }
        _ => ProxmoxError::Api {
            path: path.to_string(),
            status: status.as_u16(),
            message,
        },
    }
}
