//! Payload Compression
//!
//! LZ4 block compression for cached values. Values above a size threshold
//! are compressed unless the caller says otherwise; a compressed payload is
//! only kept when it is actually smaller.
//!
//! # Example
//!
//! ```
//! use edgecache::cache::compression::{CompressionAlgorithm, CompressionManager};
//!
//! let manager = CompressionManager::new();
//! let data = vec![b'a'; 4096];
//!
//! let (stored, algorithm) = manager.encode(&data, None).unwrap();
//! assert_eq!(algorithm, CompressionAlgorithm::Lz4);
//!
//! let restored = manager.decode(&stored, algorithm).unwrap();
//! assert_eq!(restored.as_ref(), data.as_slice());
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Payloads strictly larger than this are compressed by default
pub const DEFAULT_COMPRESSION_THRESHOLD: u64 = 1024;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as-is
    #[default]
    None,
    /// LZ4 block format with prepended size
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 compressor
pub struct Lz4Compressor {
    level: i32,
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self { level: 4 }
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Decides whether to compress and routes to the right compressor
pub struct CompressionManager {
    threshold: u64,
    noop: NoopCompressor,
    lz4: Lz4Compressor,
}

impl CompressionManager {
    /// Create with the default 1KB threshold
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_COMPRESSION_THRESHOLD)
    }

    /// Create with a custom threshold
    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            threshold,
            noop: NoopCompressor,
            lz4: Lz4Compressor::default(),
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Whether a payload of `len` bytes should be compressed
    ///
    /// An explicit flag wins; otherwise compress above the threshold.
    pub fn should_compress(&self, len: usize, explicit: Option<bool>) -> bool {
        explicit.unwrap_or(len as u64 > self.threshold)
    }

    /// Encode a payload for storage
    ///
    /// Returns (stored_bytes, algorithm_used). Falls back to the raw bytes
    /// when compression does not shrink the payload.
    pub fn encode(
        &self,
        data: &[u8],
        explicit: Option<bool>,
    ) -> Result<(Bytes, CompressionAlgorithm)> {
        if !self.should_compress(data.len(), explicit) {
            return Ok((Bytes::copy_from_slice(data), CompressionAlgorithm::None));
        }

        let compressed = self.lz4.compress(data)?;
        if compressed.len() < data.len() {
            Ok((Bytes::from(compressed), CompressionAlgorithm::Lz4))
        } else {
            tracing::trace!(
                original = data.len(),
                compressed = compressed.len(),
                "Compression did not help, storing raw payload"
            );
            Ok((Bytes::copy_from_slice(data), CompressionAlgorithm::None))
        }
    }

    /// Decode stored bytes back to the original payload
    pub fn decode(&self, data: &Bytes, algorithm: CompressionAlgorithm) -> Result<Bytes> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.clone()),
            _ => Ok(Bytes::from(self.compressor(algorithm).decompress(data)?)),
        }
    }

    /// Get the threshold in bytes
    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}
