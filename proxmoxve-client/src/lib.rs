//! # proxmoxve Client
//!
//! Session client for the Proxmox VE management API.
//!
//! The remote API is reached through two seams:
//! - [`Connector`] authenticates and produces a session handle
//! - [`ApiSession`] issues typed reads and VM status transitions
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             SessionClient               │
//! │  (build_session, start_vm, stop_vm ...) │
//! └─────────────────────┬───────────────────┘
//!                       │ Connector
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │   HttpConnector   │     │   MockConnector   │
//! │   (REST, ticket)  │     │   (in memory)     │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use proxmoxve_client::{HttpConnector, SessionClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = SessionClient::configure(
//!         "pve.example.com", 8006, "monitor", "pam", "secret", true,
//!         Arc::new(HttpConnector::new()),
//!     );
//!
//!     client.build_session().await.unwrap();
//!     client.start_vm("pve1", 100).await.unwrap();
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod mock;
pub mod traits;
pub mod types;

pub use client::SessionClient;
pub use config::{ConnectionConfig, DEFAULT_PORT, DEFAULT_REALM};
pub use error::{ProxmoxError, Result};
pub use http::HttpConnector;
pub use mock::{MockCluster, MockConnector};
pub use traits::{ApiSession, Connector};
pub use types::{is_valid_node_name, ApiItem, VmAction};
