//! Error types shared across the roost crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared leaves.
#[derive(Error, Debug)]
pub enum Error {
    /// Relay URL failed normalization or validation.
    #[error("Invalid relay URL: {0}")]
    InvalidRelayUrl(String),

    /// Textual identity could not be resolved to a pubkey.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Relay list document was missing or malformed.
    #[error("Relay list error: {0}")]
    RelayList(String),

    /// Signer delegate failure.
    #[error("Signer error: {0}")]
    Signer(String),
}
