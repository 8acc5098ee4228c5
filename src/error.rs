//! Domain-specific error types for the beacon dissector.
//!
//! Uses `thiserror` for ergonomic error definitions that integrate
//! with the broader `anyhow` error handling strategy.

use thiserror::Error;

/// Errors raised while running an aggregation plan against the store.
///
/// These stay local to the worker that issued the query: they are logged,
/// counted, retried and finally abandoned, never propagated upstream.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Store query failed: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("Failed to decode stored {field}: {source}")]
    Decode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid stored {field}: '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("Malformed query plan: {0}")]
    MalformedPlan(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while opening or preparing the connection-graph store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open store '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Invalid collection name '{0}' (expected [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidCollection(String),

    #[error("Failed to create schema for '{collection}': {source}")]
    Schema {
        collection: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Store operation failed: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("Failed to encode connection record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors returned to the upstream caller of `Dissector::submit`.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Rejected resolution unit for '{fqdn}': {reason}")]
    InvalidUnit { fqdn: String, reason: &'static str },

    #[error("Intake closed: no dissector workers are running")]
    IntakeClosed,
}

/// Errors raised while starting the dissection stage.
#[derive(Error, Debug)]
pub enum DissectError {
    #[error("Invalid dissector settings: {0}")]
    InvalidSettings(String),

    #[error("Failed to open store session for worker {worker}: {source}")]
    Session {
        worker: usize,
        #[source]
        source: StoreError,
    },

    #[error("Failed to spawn dissector worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type alias using anyhow for application-level error handling.
pub type Result<T> = anyhow::Result<T>;
