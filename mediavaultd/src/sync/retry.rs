use std::time::Duration;

use crate::backend::BackendError;

use super::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Auth or validation problem; retrying cannot help.
    Permanent,
    /// Server hiccup or network failure; worth a bounded number of retries.
    Transient,
    /// Explicit quota or rate-limit signal; wait it out, never give up.
    Quota,
}

const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "resource_exhausted",
    "ratelimitexceeded",
    "too many requests",
];

const NETWORK_MARKERS: &[&str] = &[
    "connection",
    "timeout",
    "timed out",
    "reset",
    "econnreset",
    "etimedout",
    "econnrefused",
    "enotfound",
    "not found",
    "socket hang up",
    "network",
];

const PERMANENT_CODES: &[u16] = &[400, 401, 403, 404, 405, 409, 410, 411, 413, 415, 422];
const TRANSIENT_CODES: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

/// Pure function of `(code, message)`.
///
/// Quota markers win over the status code because services report quota
/// exhaustion with both 403 and 429.
pub fn classify(code: Option<u16>, message: &str) -> ErrorClass {
    let message = message.to_ascii_lowercase();
    if QUOTA_MARKERS.iter().any(|marker| message.contains(marker)) {
        return ErrorClass::Quota;
    }
    if let Some(code) = code {
        if PERMANENT_CODES.contains(&code) {
            return ErrorClass::Permanent;
        }
        if TRANSIENT_CODES.contains(&code) || (500..600).contains(&code) {
            return ErrorClass::Transient;
        }
    }
    if NETWORK_MARKERS.iter().any(|marker| message.contains(marker)) {
        return ErrorClass::Transient;
    }
    ErrorClass::Permanent
}

pub fn classify_error(err: &BackendError) -> ErrorClass {
    classify(err.code, &err.message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the same file after this delay.
    RetryAfter(Duration),
    /// Hand over to the rate limiter's long quota backoff.
    QuotaBackoff,
    /// Record the file as failed.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::new(base, max),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// `transient_retries` counts retries already spent on this file.
    pub fn decide(&self, err: &BackendError, transient_retries: u32) -> RetryDecision {
        match classify_error(err) {
            ErrorClass::Quota => RetryDecision::QuotaBackoff,
            ErrorClass::Permanent => RetryDecision::GiveUp,
            ErrorClass::Transient if transient_retries >= self.max_retries => RetryDecision::GiveUp,
            ErrorClass::Transient => RetryDecision::RetryAfter(
                self.backoff
                    .delay_with_hint(transient_retries, err.retry_after()),
            ),
        }
    }
}
