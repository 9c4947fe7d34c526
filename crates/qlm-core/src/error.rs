// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared by the store, codec and session layers.

use thiserror::Error;

/// Errors returned by [`crate::store::Datastore`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Node has never been written, or was queried by an unknown id.
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Request id is not (or no longer) tracked.
    #[error("No subscription found for {0}")]
    UnknownSubscription(String),

    /// Write target cannot be stored (e.g. empty node id).
    #[error("Invalid node: {0}")]
    InvalidNode(String),
}

/// Envelope encoding/decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Inbound bytes are not a well-formed envelope.
    #[error("Malformed envelope: {0}")]
    Decode(String),

    /// Outbound envelope could not be serialized.
    #[error("Encode error: {0}")]
    Encode(String),
}

/// Errors ending a connection session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Outbound sink or transport write failed.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Inbound transport failed while reading.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::UnknownSubscription("REQ0000001".into());
        assert_eq!(err.to_string(), "No subscription found for REQ0000001");

        let err = CodecError::Decode("trailing bytes".into());
        assert!(err.to_string().contains("Malformed"));

        let err = SessionError::Delivery("closed".into());
        assert!(err.to_string().contains("Delivery"));
    }
}
