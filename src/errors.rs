//! Error categorisation for requests and scenario iterations.
//!
//! Transport problems never propagate out of a worker. They are classified
//! here, attached to the response, and recorded as failed samples.

use std::fmt;
use thiserror::Error;

/// Categories of request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP 4xx responses
    ClientError,

    /// HTTP 5xx responses
    ServerError,

    /// Connection refused, DNS, reset, body read failures
    NetworkError,

    /// The request exceeded its timeout
    TimeoutError,

    /// TLS/SSL certificate errors
    TlsError,

    /// Anything else, including unexpected status codes
    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code.
    ///
    /// Returns None for statuses that count as a successful request (200-399).
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a reqwest transport error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() || error.is_request() || error.is_body() || error.is_decode() {
            ErrorCategory::NetworkError
        } else if error.is_redirect() {
            ErrorCategory::ClientError
        } else {
            let error_msg = error.to_string().to_lowercase();

            if error_msg.contains("certificate")
                || error_msg.contains("tls")
                || error_msg.contains("ssl")
            {
                ErrorCategory::TlsError
            } else if error_msg.contains("timeout") {
                ErrorCategory::TimeoutError
            } else if error_msg.contains("dns") || error_msg.contains("connect") {
                ErrorCategory::NetworkError
            } else {
                ErrorCategory::OtherError
            }
        }
    }

    /// Short machine-friendly label (also used as a log field).
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::OtherError => "other_error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A transport-level failure attached to an [`HttpResponse`](crate::client::HttpResponse).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{category}] {message}")]
pub struct RequestError {
    pub category: ErrorCategory,
    pub message: String,
}

impl RequestError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::TimeoutError, message)
    }

    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        Self::new(ErrorCategory::from_reqwest_error(error), error.to_string())
    }
}

/// Error a scenario may return from an iteration.
///
/// The worker logs it and carries on with the next iteration.
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Scenario aborted iteration: {0}")]
    Aborted(String),
}
