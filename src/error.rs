//! Error taxonomy for relay synchronization.

use thiserror::Error;

/// Errors surfaced by the synchronization layer.
///
/// Relay transport failures are recorded as [`ClientError::Transport`] inside
/// the relay layer but are never returned from a fetch: a fetch with no
/// reachable relay simply yields fewer (or zero) events.
#[derive(Error, Debug)]
pub enum ClientError {
    /// A single relay could not be reached or misbehaved.
    #[error("relay transport error: {0}")]
    Transport(String),

    /// No relay acknowledged a published event.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Ciphertext was not produced for this keypair/peer pair.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// User input rejected before any state was touched.
    #[error("{0}")]
    Validation(String),

    /// Event id does not match its content hash, or its signature is invalid.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Key material could not be parsed or used.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Name registration side-service rejected the request.
    #[error("name registration failed: {0}")]
    Naming(String),

    /// Secure storage or blob persistence failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The flow requires a logged-in identity.
    #[error("not logged in")]
    NotLoggedIn,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
