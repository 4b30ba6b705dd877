use serde::Serialize;
use std::fmt;

/// How one pipeline iteration ended for a claimed URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Fetched, parsed and stored
    Fetched,

    /// Transient failure; the URL went back to the frontier with a backoff delay
    Retrying,

    /// 3xx answer; the target went back through the frontier
    Redirected,

    /// Permanent failure or retries exhausted
    Failed,

    /// robots.txt disallows the URL for our user agent
    RobotsBlocked,
}

impl Outcome {
    /// Returns true if the URL will not be attempted again in this crawl
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Retrying)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Fetched)
    }

    /// Converts the outcome to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Retrying => "retrying",
            Self::Redirected => "redirected",
            Self::Failed => "failed",
            Self::RobotsBlocked => "robots_blocked",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
