//! Error types at the cache boundaries.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::keys::CacheKey;

/// Transport-level category of a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Status,
    Network,
    Timeout,
    Decode,
}

impl FetchErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchErrorKind::Status => "status",
            FetchErrorKind::Network => "network",
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Decode => "decode",
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the executor reacts to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, transport failures and everything outside 401/403/404.
    Retryable,
    /// 404: the resource is gone.
    NotFound,
    /// 401/403: credentials or permissions problem.
    Denied,
}

/// Failure reported by a resource fetcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} failure{}: {message}", status_suffix(.status))]
pub struct FetchError {
    kind: FetchErrorKind,
    status: Option<u16>,
    message: String,
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|code| format!(" (status {code})"))
        .unwrap_or_default()
}

impl FetchError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Status,
            status: Some(code),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Network,
            status: None,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: FetchErrorKind::Timeout,
            status: None,
            message: format!("no response within {}ms", after.as_millis()),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Decode,
            status: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FetchErrorKind {
        self.kind
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn class(&self) -> ErrorClass {
        match self.status {
            Some(404) => ErrorClass::NotFound,
            Some(401) | Some(403) => ErrorClass::Denied,
            _ => ErrorClass::Retryable,
        }
    }
}

/// Outcome error of a query. `Clone` so one result can fan out to every
/// coalesced caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("resource `{key}` not found")]
    NotFound { key: CacheKey },
    #[error("access to `{key}` denied (status {status})")]
    Denied { key: CacheKey, status: u16 },
    #[error("fetching `{key}` failed after {attempts} attempt(s): {last}")]
    Exhausted {
        key: CacheKey,
        attempts: u32,
        last: FetchError,
    },
    #[error("fetch task for `{key}` ended abnormally: {reason}")]
    Aborted { key: CacheKey, reason: String },
}

impl QueryError {
    pub fn key(&self) -> &CacheKey {
        match self {
            QueryError::NotFound { key }
            | QueryError::Denied { key, .. }
            | QueryError::Exhausted { key, .. }
            | QueryError::Aborted { key, .. } => key,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            QueryError::NotFound { .. } => "not_found",
            QueryError::Denied { .. } => "denied",
            QueryError::Exhausted { .. } => "exhausted",
            QueryError::Aborted { .. } => "aborted",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("change feed subscription failed: {0}")]
    Subscribe(String),
    #[error("change feed is closed")]
    Closed,
}

impl FeedError {
    pub fn subscribe(message: impl Into<String>) -> Self {
        Self::Subscribe(message.into())
    }
}
