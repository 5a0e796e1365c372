// src/error.rs
// Error taxonomy for the workspace-mesh core (spec section 7)

use thiserror::Error;

/// Failures from the crypto primitives (section 4.1). Every underlying
/// failure collapses to this one kind; callers don't need to distinguish
/// "bad key" from "bad ciphertext" to decide what to do next.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("malformed armored key: {0}")]
    MalformedKey(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("key derivation failed: {0}")]
    Derivation(String),
}

/// Failures from the `Storage` port.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures touching the filesystem (directory scans, file reads/writes).
#[derive(Debug, Error)]
pub enum IoError {
    #[error("io error on {path}: {source}")]
    Fs {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures from the transport port (rendezvous RPC, peer streams, gossip).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no reachable rendezvous")]
    NoReachableRendezvous,
    #[error("stream error: {0}")]
    Stream(String),
    #[error("operation timed out")]
    Timeout,
}

/// Top-level error type every public core operation returns.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown workspace: {0}")]
    UnknownWorkspace(String),
    #[error("unknown challenge")]
    UnknownChallenge,
    #[error("unknown request")]
    UnknownRequest,
    #[error("not permitted")]
    NotPermitted,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("stale timestamp")]
    StaleTimestamp,
    #[error("invalid solution")]
    InvalidSolution,
    #[error("integrity failure")]
    IntegrityFailure,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] IoError),
}

pub type CoreResult<T> = Result<T, CoreError>;
