//! Bridge error taxonomy.
//!
//! Load-time failures (`LibraryNotFound`, `OffsetOutOfRange`, `OffsetParse`,
//! `Unsupported`) are fatal for initialization; per-request failures are
//! returned as typed values and never unwind past the bridge.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the native-call bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No candidate library could be resolved.
    #[error("no candidate library resolved (tried {tried:?})")]
    LibraryNotFound {
        /// The identifiers that were attempted, in order.
        tried: Vec<String>,
    },

    /// The computed target address is not a plausible entry point.
    #[error("target address {address:#x} out of range: {reason}")]
    OffsetOutOfRange {
        /// The offending absolute address (0 when arithmetic overflowed).
        address: usize,
        /// Why the address was rejected.
        reason: String,
    },

    /// The offset expression failed to parse or evaluate.
    #[error("invalid offset expression: {0}")]
    OffsetParse(String),

    /// The marshalling contract is internally inconsistent.
    #[error("invalid call contract: {0}")]
    ContractInvalid(String),

    /// `sign` was called before `load` or after `unload`.
    #[error("sign module not initialized")]
    NotInitialized,

    /// Malformed request input; a client-side fault.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The foreign call reported failure or produced an invalid result.
    /// Never retried: the opaque module's state after a failure is unknown.
    #[error("native call failed: {0}")]
    NativeCall(String),

    /// The foreign-call lock was not acquired within the configured bound.
    #[error("native call serialization timed out after {0:?}")]
    CallTimeout(Duration),

    /// Loaded-module enumeration is not available on this platform.
    #[error("loaded-module enumeration is unsupported on this platform")]
    Unsupported,
}

impl BridgeError {
    /// Whether the error indicates a client-side fault (bad request input)
    /// as opposed to a server-side one. The API layer uses this to pick the
    /// status class.
    pub fn is_client_fault(&self) -> bool {
        matches!(self, BridgeError::InvalidInput(_))
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
