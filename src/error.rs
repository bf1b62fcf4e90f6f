//! Error types for the Edge Caching Engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Edge Caching Engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Storage Adapter Errors
    // =========================================================================
    /// Backend adapter rejected or failed an operation
    #[error("Storage adapter for layer {layer} failed during {operation}: {reason}")]
    Adapter {
        layer: String,
        operation: &'static str,
        reason: String,
    },

    /// Backend adapter did not answer in time
    #[error("Storage adapter for layer {layer} timed out during {operation} after {timeout_ms}ms")]
    AdapterTimeout {
        layer: String,
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Layer id not present in the registry
    #[error("Unknown cache layer: {0}")]
    LayerNotFound(String),

    // =========================================================================
    // Key / Tenant Errors
    // =========================================================================
    /// Logical key rejected
    #[error("Invalid cache key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Tenant id rejected
    #[error("Invalid tenant id '{tenant}': {reason}")]
    InvalidTenant { tenant: String, reason: String },

    /// Key pattern could not be compiled
    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Caller-supplied option is out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    // =========================================================================
    // Compression / Integrity Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Stored bytes no longer match the recorded checksum
    #[error("Checksum mismatch for {key} in layer {layer}")]
    IntegrityCheckFailed { key: String, layer: String },
}
