//! Error taxonomy for the virtual-device transport stack.
//!
//! Mirrors the failure classes from the protocol design: crypto-integrity
//! failures and handshake timeouts are fatal to a connection attempt;
//! transport errors trigger the reconnect loop; protocol and correlation
//! issues are recoverable and only ever logged.

use thiserror::Error;

/// Errors surfaced by `devswarm-core`.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// HMAC mismatch, bad CBC padding, or RSA decrypt failure during the
    /// handshake or a subsequent frame. Fatal to the current connection.
    #[error("crypto integrity failure: {0}")]
    CryptoIntegrity(String),

    /// Socket error, close, or idle timeout.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// No hello response from the server within the handshake timeout.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A `waitForResponse` call timed out. Non-fatal; callers resume.
    #[error("no response received for message id {0}")]
    CorrelationTimeout(u16),

    /// Malformed CoAP packet that could not be parsed.
    #[error("malformed CoAP packet: {0}")]
    MalformedPacket(String),
}

/// Result alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, DeviceError>;
