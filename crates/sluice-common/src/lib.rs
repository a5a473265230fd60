//! Sluice Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types and utilities for the Sluice workspace:
//!
//! - **Error Handling**: the `SluiceError` taxonomy and `Result` alias
//! - **Checksums**: SHA-256 helpers for content-addressed raw artifacts
//! - **Naming**: strict identifier rules and the raw-object path scheme
//! - **Logging**: centralized tracing initialization

pub mod checksum;
pub mod error;
pub mod logging;
pub mod naming;

// Re-export commonly used types
pub use error::{Result, SluiceError};
