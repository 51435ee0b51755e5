//! # proxmoxve Common
//!
//! Shared utilities for the Proxmox VE bridge crates.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use proxmoxve_common::{init_logging, TimedOperation};
//!
//! init_logging("info").unwrap();
//!
//! let op = TimedOperation::new("refresh", "pve.example.com");
//! // ... do work ...
//! op.finish();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat, TimedOperation};
