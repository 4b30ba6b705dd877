//! Failure classification and retry/backoff decisions

use crate::config::RetryConfig;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Why a fetch did not produce a usable page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum ErrorKind {
    /// The request did not complete within the timeout
    Timeout,

    /// DNS, TCP or TLS failure, or the connection dropped mid-response
    Connect,

    /// HTTP 5xx
    ServerError(u16),

    /// HTTP 408, 425 or 429
    RetryableStatus(u16),

    /// Any other non-2xx status
    ClientError(u16),

    /// Body larger than the configured maximum
    Oversize,

    /// Response is not HTML
    DisallowedContentType,

    /// Unusable URL, undecodable body or redirect failure
    Malformed,
}

impl ErrorKind {
    /// Maps a non-2xx HTTP status to its error kind
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 425 | 429 => Self::RetryableStatus(status),
            500..=599 => Self::ServerError(status),
            _ => Self::ClientError(status),
        }
    }

    /// Transient kinds are worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connect | Self::ServerError(_) | Self::RetryableStatus(_)
        )
    }

    /// HTTP status associated with the failure, if there was a response
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ServerError(s) | Self::RetryableStatus(s) | Self::ClientError(s) => Some(*s),
            _ => None,
        }
    }

    /// Stable label used in storage and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::ServerError(_) => "server_error",
            Self::RetryableStatus(_) => "retryable_status",
            Self::ClientError(_) => "client_error",
            Self::Oversize => "oversize",
            Self::DisallowedContentType => "disallowed_content_type",
            Self::Malformed => "malformed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            Some(status) => write!(f, "{} ({})", self.label(), status),
            None => write!(f, "{}", self.label()),
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    /// Wait before the next attempt; zero when `retry` is false
    pub delay: Duration,
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Decides whether to retry after `attempts` fetches (the failed one included)
    ///
    /// Retries only transient kinds while `attempts < max_attempts`. The delay is
    /// `min(base * 2^attempts, max_delay)`.
    pub fn decide(&self, attempts: u32, kind: ErrorKind) -> RetryDecision {
        if !kind.is_transient() || attempts >= self.max_attempts {
            return RetryDecision {
                retry: false,
                delay: Duration::ZERO,
            };
        }

        RetryDecision {
            retry: true,
            delay: self.backoff(attempts),
        }
    }

    /// `min(base * 2^attempts, max_delay)`, saturating
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
