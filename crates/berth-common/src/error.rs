//! Unified error types for the berth workspace.
//!
//! Stream consumers surface exactly one terminal error to their caller, so
//! every failure mode of the stream layer maps onto one [`BerthError`]
//! variant.

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// The HTTP exchange with the daemon failed (connect, reset, TLS, ...).
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Reading or writing a byte stream failed.
    #[error("I/O error while {context}: {source}")]
    Io {
        /// What was being done when the error occurred.
        context: &'static str,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A multiplexed stream violated the frame format.
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    /// A JSON document could not be decoded.
    #[error("decode error: {source}")]
    Decode {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// The daemon answered 404 for the requested subject.
    #[error("no such {kind}: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The daemon answered with a non-404 error status.
    #[error("daemon returned HTTP {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, usually a JSON `{"message": ...}` document.
        message: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },
}

/// Violations of the 8-byte-header multiplexing format.
///
/// All of these are terminal for the stream they occur on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The stream ended part-way through a frame header.
    #[error("truncated frame header: got {got} of 8 bytes")]
    TruncatedHeader {
        /// Header bytes read before end of stream.
        got: usize,
    },

    /// The stream ended before the announced payload length was read.
    #[error("truncated frame payload: expected {expected} bytes, got {got}")]
    TruncatedPayload {
        /// Payload length announced by the header.
        expected: usize,
        /// Payload bytes read before end of stream.
        got: usize,
    },

    /// Header byte 0 is not a known stream tag.
    #[error("unknown stream tag {0}")]
    UnknownStreamTag(u8),

    /// A payload does not fit the 32-bit length field.
    #[error("payload of {0} bytes exceeds the frame length field")]
    PayloadTooLarge(usize),
}

impl BerthError {
    /// Wraps an I/O error with a short description of the failed operation.
    #[must_use]
    pub const fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Returns whether this error is the typed not-found family.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_kind_and_id() {
        let err = BerthError::NotFound {
            kind: "container",
            id: "xyz".into(),
        };
        assert_eq!(err.to_string(), "no such container: xyz");
        assert!(err.is_not_found());
    }

    #[test]
    fn frame_error_converts_into_framing_variant() {
        let err: BerthError = FrameError::TruncatedHeader { got: 3 }.into();
        assert!(matches!(
            err,
            BerthError::Framing(FrameError::TruncatedHeader { got: 3 })
        ));
        assert!(!err.is_not_found());
    }

    #[test]
    fn decode_error_converts_from_serde_json() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = BerthError::from(source);
        assert!(err.to_string().starts_with("decode error"));
    }
}
