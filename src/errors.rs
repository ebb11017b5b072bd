//! Classification of transport failures for diagnostics.
//!
//! Requests that never produce an HTTP response are grouped into coarse
//! categories so failure logs and error summaries stay readable at high
//! request volumes.

use std::fmt;

/// Categories of transport-level failures observed during an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Request timed out before a response arrived
    Timeout,

    /// Connection-level errors (DNS, refused, reset)
    Network,

    /// TLS/certificate errors
    Tls,

    /// Errors while reading or decoding the response body
    Body,

    /// Anything else
    Other,
}

impl FailureKind {
    /// Categorize a reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            FailureKind::Timeout
        } else if error.is_connect() || error.is_request() {
            FailureKind::Network
        } else if error.is_body() || error.is_decode() {
            FailureKind::Body
        } else {
            let message = error.to_string().to_lowercase();

            if message.contains("certificate") || message.contains("tls") || message.contains("ssl")
            {
                FailureKind::Tls
            } else if message.contains("timeout") {
                FailureKind::Timeout
            } else if message.contains("dns")
                || message.contains("resolve")
                || message.contains("connect")
                || message.contains("connection")
            {
                FailureKind::Network
            } else {
                FailureKind::Other
            }
        }
    }

    /// Short label used as a structured-logging field value.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Network => "network",
            FailureKind::Tls => "tls",
            FailureKind::Body => "body",
            FailureKind::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
