//! Error types for the adapter's wire protocols and backend client.
//!
//! `FramingError` covers netstring decoding failures on lookup connections.
//! `SanitizeError` covers email normalization failures; callers treat these
//! as "no result" rather than surfacing them to the MTA. `UserliError`
//! covers the outbound HTTP client and keeps transport, HTTP-layer, and
//! decode failures distinguishable for logs and metrics even though the
//! wire protocols collapse them into a single temporary-error class.

use thiserror::Error;

/// Errors that can occur while decoding a netstring frame.
///
/// Each variant maps to a specific failure mode of the decoder. The lookup
/// handler drops the connection on any of these; a peer that desynchronized
/// the framing cannot be resynchronized mid-stream.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The length prefix announces a payload larger than the decoder accepts.
    #[error("frame exceeds maximum size of {max_bytes} bytes")]
    FrameTooLarge {
        /// The configured maximum payload size in bytes.
        max_bytes: usize,
    },

    /// A byte in the length prefix was neither a digit nor the `:` separator.
    #[error("invalid byte {byte:#04x} in length prefix")]
    InvalidLength {
        /// The offending byte.
        byte: u8,
    },

    /// The payload was not followed by the `,` terminator.
    #[error("frame payload not terminated by ','")]
    MissingTerminator,

    /// The stream ended in the middle of a frame.
    #[error("connection closed mid-frame")]
    UnexpectedEof,

    /// An underlying IO error occurred while reading.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures normalizing an email address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanitizeError {
    /// The input does not contain exactly one `@` separating two parts.
    #[error("invalid email format: {email}")]
    InvalidFormat {
        /// The (normalized) input that was rejected.
        email: String,
    },

    /// The local part is empty or contains disallowed characters.
    #[error("invalid local part: {local_part}")]
    InvalidLocalPart {
        /// The local part after delimiter truncation.
        local_part: String,
    },
}

/// Errors from calls to the userli backend.
#[derive(Debug, Error)]
pub enum UserliError {
    /// The request did not complete within its deadline.
    #[error("request to {endpoint} endpoint timed out")]
    Timeout {
        /// The API resource that was queried.
        endpoint: String,
    },

    /// TCP or TLS level failure reaching the backend.
    #[error("failed to connect to backend: {reason}")]
    Connect {
        /// Human-readable description of the connection failure.
        reason: String,
    },

    /// The backend answered with a non-2xx status.
    #[error("backend returned HTTP {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
    },

    /// The response body could not be decoded as the expected JSON shape.
    #[error("failed to decode backend response: {reason}")]
    Decode {
        /// Human-readable description of the decode failure.
        reason: String,
    },

    /// Any other transport failure.
    #[error("backend request failed: {reason}")]
    Transport {
        /// Human-readable description of the failure.
        reason: String,
    },
}
