//! # Error Types
//!
//! Comprehensive error handling for the lobby protocol.
//!
//! This module defines all error variants that can occur while driving a
//! lobby connection, from low-level I/O failures to server-reported login
//! rejections.
//!
//! ## Error Categories
//! - **Connection errors**: socket failures, use before connect, premature
//!   stream closure — fatal to the current run.
//! - **Decode errors**: byte counts inconsistent with the fixed wire layout,
//!   indicating protocol desynchronization — fatal.
//! - **Protocol errors**: a server-sent login error carrying its original
//!   code/param/row/message so callers can drive retry policy.
//! - **Correlation failures**: a pending request resolved with the wrong
//!   operation tag, or dropped before resolution — fail only that request.
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

/// Primary error type for all lobby protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("client not connected")]
    NotConnected,

    #[error("connection closed by remote")]
    ConnectionClosed,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("cipher not initialized")]
    CipherNotReady,

    #[error("fingerprint not yet assigned by server")]
    FingerprintUnknown,

    /// Server-sent login rejection. Fields are surfaced verbatim from the
    /// wire payload so callers can decide on a retry strategy (for example,
    /// discarding a cached session id on a specific code).
    #[error("login rejected (code {code}, param {param}, row {row}): {message}")]
    LoginError {
        code: u16,
        param: u32,
        row: u16,
        message: String,
    },

    #[error("no active service accounts")]
    NoActiveAccounts,

    #[error("login has not completed")]
    NotLoggedIn,

    #[error("unexpected reply operation {0:#04x}")]
    UnexpectedOperation(u8),

    #[error("pending request dropped before a reply arrived")]
    RequestDropped,

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::Decode`] describing a fixed-layout
    /// size mismatch.
    pub(crate) fn size_mismatch(what: &str, expected: usize, actual: usize) -> Self {
        Self::Decode(format!("{what}: expected {expected} bytes, got {actual}"))
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
