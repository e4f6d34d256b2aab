//! Outcome taxonomy and the mapping from raw transport results into it.
//!
//! Every public verb resolves to either a payload or a [`Failure`], which pairs
//! one of the five [`CardDavResponse`] values with the detailed [`ErrorDetail`]
//! that produced it.

use std::fmt;

use thiserror::Error;

use crate::transport::{HttpReply, TransportError};

/// Code used when the transport produced no HTTP status at all.
pub const TRANSPORT_FAILURE: i64 = -1;

/// Code used when a required field is missing from the caller's input.
pub const VALIDATION_FAILURE: i64 = 1;

/// Code used for "the probe answered but nothing matched".
pub const NO_MATCH: i64 = 0;

/// Message reported when discovery finds nothing to act upon.
pub const NO_OBJECT_FOUND: &str = "No object found";

/// The only values a caller ever sees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardDavResponse {
    Ok,
    Forbidden,
    Conflict,
    Locked,
    NotImplemented,
}

impl CardDavResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardDavResponse::Ok => "OK",
            CardDavResponse::Forbidden => "FORBIDDEN",
            CardDavResponse::Conflict => "CONFLICT",
            CardDavResponse::Locked => "LOCKED",
            CardDavResponse::NotImplemented => "NOTIMPLEMENTED",
        }
    }
}

impl fmt::Display for CardDavResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detailed cause of a failed call.
///
/// `code` is negative for transport failures, the HTTP status for protocol
/// failures, and a small positive sentinel for local validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: i64,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// A reply whose status fell outside the verb's success set.
    pub fn from_reply(reply: &HttpReply) -> Self {
        let message = if reply.body.trim().is_empty() {
            reply
                .status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        } else {
            reply.body.clone()
        };
        Self::new(i64::from(reply.status.as_u16()), message)
    }

    pub fn from_transport(err: &TransportError) -> Self {
        Self::new(TRANSPORT_FAILURE, err.to_string())
    }

    /// Discovery found zero matching resources.
    pub fn no_object_found() -> Self {
        Self::new(409, NO_OBJECT_FOUND)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(VALIDATION_FAILURE, message)
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// A non-OK outcome of one orchestration call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{response}: {detail}")]
pub struct Failure {
    pub response: CardDavResponse,
    pub detail: ErrorDetail,
}

impl Failure {
    pub fn code(&self) -> i64 {
        self.detail.code
    }

    pub fn message(&self) -> &str {
        &self.detail.message
    }
}

impl From<ErrorDetail> for Failure {
    fn from(detail: ErrorDetail) -> Self {
        Failure {
            response: classify(&detail),
            detail,
        }
    }
}

impl From<TransportError> for Failure {
    fn from(err: TransportError) -> Self {
        ErrorDetail::from_transport(&err).into()
    }
}

/// Map an HTTP status onto the taxonomy. Anything unrecognised is a conflict.
pub fn map_status(status: u16) -> CardDavResponse {
    match status {
        403 => CardDavResponse::Forbidden,
        409 => CardDavResponse::Conflict,
        423 => CardDavResponse::Locked,
        501 => CardDavResponse::NotImplemented,
        _ => CardDavResponse::Conflict,
    }
}

/// Map a populated error detail onto the taxonomy.
///
/// Transport failures, sentinels and zero codes fall back to CONFLICT so that
/// callers default to manual conflict resolution.
pub fn classify(detail: &ErrorDetail) -> CardDavResponse {
    match u16::try_from(detail.code) {
        Ok(status) if status >= 100 => map_status(status),
        _ => CardDavResponse::Conflict,
    }
}

/// Local errors that are not protocol outcomes
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to read CA certificate {path}: {source}")]
    CaCertificate {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
