//! Raw fetch failures and their classification into a closed set of displayable errors.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

use crate::caching::CacheKey;

/// An error that happens when fetching a payload from the remote API.
///
/// This is what a [`RemoteFetcher`](crate::fetcher::RemoteFetcher) reports. It never reaches a
/// consumer directly, see [`ClassifiedError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The fetch did not finish within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The remote API responded with a non-success status code.
    ///
    /// The attached string contains the remote API's response.
    #[error("server responded with status {status}: {details}")]
    Status { status: u16, details: String },
    /// No response was received, like connection loss or DNS resolution failure.
    #[error("network error: {0}")]
    Network(String),
    /// The fetch was cancelled before it could settle.
    #[error("request cancelled")]
    Cancelled,
    /// Any other problem.
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Returns the HTTP status code attached to this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn root_cause(mut error: &dyn Error) -> String {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        error_string
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        let details = Self::root_cause(&error);
        if let Some(status) = error.status() {
            Self::Status {
                status: status.as_u16(),
                details,
            }
        } else if error.is_connect()
            || error.is_timeout()
            || error.is_request()
            || error.is_body()
        {
            Self::Network(details)
        } else {
            Self::Other(details)
        }
    }
}

/// The closed set of failure kinds a consumer can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Timeout,
    Unauthorized,
    ServerError,
    Network,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ServerError => "SERVER_ERROR",
            Self::Network => "NETWORK",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized failure descriptor with a closed-set [`ErrorKind`] and a displayable message.
///
/// This is cheap to clone, every subscriber of a single fetch receives an identical copy.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    endpoint: Arc<str>,
    key: String,
    occurred_at: SystemTime,
    #[source]
    cause: Arc<FetchError>,
}

impl PartialEq for ClassifiedError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.message == other.message
            && self.key == other.key
            && self.occurred_at == other.occurred_at
            && self.cause == other.cause
    }
}

impl ClassifiedError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The endpoint that failed.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The full query that failed, endpoint and parameters.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn occurred_at(&self) -> SystemTime {
        self.occurred_at
    }

    /// The raw failure this was classified from.
    pub fn cause(&self) -> &FetchError {
        &self.cause
    }
}

impl Serialize for ClassifiedError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let occurred_at = DateTime::<Utc>::from(self.occurred_at)
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut s = serializer.serialize_struct("ClassifiedError", 6)?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("message", &self.message)?;
        s.serialize_field("endpoint", &*self.endpoint)?;
        s.serialize_field("key", &self.key)?;
        s.serialize_field("occurred_at", &occurred_at)?;
        s.serialize_field("cause", &self.cause.to_string())?;
        s.end()
    }
}

/// Classifies a raw failure that happened just now.
pub fn classify(raw: FetchError, key: &CacheKey) -> ClassifiedError {
    classify_at(raw, key, SystemTime::now())
}

/// Classifies a raw failure that happened at the given time.
///
/// In priority order: a deadline is a [`Timeout`](ErrorKind::Timeout), HTTP 401 and 403 are
/// [`Unauthorized`](ErrorKind::Unauthorized), any HTTP status from 500 upwards is a
/// [`ServerError`](ErrorKind::ServerError), a missing response is a
/// [`Network`](ErrorKind::Network) error, and everything else is
/// [`Unknown`](ErrorKind::Unknown) with the raw message preserved.
pub fn classify_at(raw: FetchError, key: &CacheKey, occurred_at: SystemTime) -> ClassifiedError {
    let (kind, message) = match &raw {
        FetchError::Timeout(_) => (
            ErrorKind::Timeout,
            "Request timed out. Please try again.".to_owned(),
        ),
        FetchError::Status {
            status: 401 | 403, ..
        } => (
            ErrorKind::Unauthorized,
            "Authentication required. Please log in.".to_owned(),
        ),
        FetchError::Status { status, .. } if *status >= 500 => (
            ErrorKind::ServerError,
            "Server error. Please try again later.".to_owned(),
        ),
        FetchError::Network(_) => (
            ErrorKind::Network,
            "Network error. Please check your connection.".to_owned(),
        ),
        other => (ErrorKind::Unknown, other.to_string()),
    };

    ClassifiedError {
        kind,
        message,
        endpoint: key.endpoint_arc(),
        key: key.to_string(),
        occurred_at,
        cause: Arc::new(raw),
    }
}
