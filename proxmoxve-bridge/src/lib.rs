//! # proxmoxve Bridge
//!
//! Keeps a refreshed snapshot of each configured Proxmox VE cluster and
//! exposes VM lifecycle actions as services.
//!
//! ## Architecture
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 EntryRegistry                │
//! │   (setup, unload, options change, reload)    │
//! └───────┬──────────────────────────┬───────────┘
//!         │ per entry                │ per entry
//!         ▼                          ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │ RefreshCoordinator│     │  ServiceRegistry  │
//! │ (snapshot, loop)  │     │  (VM actions)     │
//! └─────────┬─────────┘     └─────────┬─────────┘
//!           └──────────┬──────────────┘
//!                      ▼
//!               SessionClient
//! ```

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod entry;
pub mod http_server;
pub mod services;
pub mod snapshot;

pub use config::{Config, EntryConfig, EntryOptions};
pub use coordinator::{RefreshCoordinator, RefreshFailed, RefreshOutcome};
pub use entry::{EntryRegistry, SetupError};
pub use services::{ServiceError, ServiceRegistry, VmActionRequest};
pub use snapshot::{ClusterSnapshot, NodeRecord};
