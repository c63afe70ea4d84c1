//! Error types for Omnibox
//!
//! This module defines all error types used throughout the service.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use thiserror::Error;

/// The primary error type for Omnibox operations.
///
/// Propagation policy: failures during adapter `initialize()` or explicit
/// send calls surface to the immediate caller; failures during inbound
/// ingestion are swallowed at the pipeline boundary and only logged, so
/// provider event sources are never destabilized by a persistence problem.
#[derive(Error, Debug)]
pub enum OmniError {
    /// Missing or invalid credentials/configuration, fatal to `initialize`
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider unreachable (transient)
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Operation attempted outside the connected state
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Provider rejected a send; carries the provider's diagnostic payload
    #[error("Send rejected: {0}")]
    Send(String),

    /// Outbound media reference the adapter cannot accept (not transient)
    #[error("Invalid media source: {0}")]
    InvalidMediaSource(String),

    /// Declared capability gap for this adapter (not transient)
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Channel record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Channel is administratively disabled
    #[error("Channel inactive: {0}")]
    InactiveChannel(String),

    /// Adapter-internal errors (event stream failures, malformed requests, etc.)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Database errors from the persistence gateway
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for Omnibox operations.
pub type Result<T> = std::result::Result<T, OmniError>;
