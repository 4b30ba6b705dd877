use crate::clock::Millis;

/// Per-domain record kept in the shared store
///
/// `next_allowed_at` is only ever advanced by the store's atomic reservation; the robots
/// fields are only written when rules are recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainState {
    pub domain: String,

    /// Earliest time the next request to this domain may start (epoch milliseconds)
    pub next_allowed_at: Millis,

    /// Raw robots.txt content; an empty string allows everything
    pub robots_rules: Option<String>,

    pub robots_fetched_at: Option<Millis>,

    pub robots_expires_at: Option<Millis>,
}

impl DomainState {
    /// Creates a record for a domain that has never been contacted
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            next_allowed_at: 0,
            robots_rules: None,
            robots_fetched_at: None,
            robots_expires_at: None,
        }
    }

    /// Checks if a request could start at `now`
    pub fn can_request(&self, now: Millis) -> bool {
        now >= self.next_allowed_at
    }

    /// Returns the cached robots.txt content if it has not expired at `now`
    pub fn fresh_robots(&self, now: Millis) -> Option<&str> {
        match (&self.robots_rules, self.robots_expires_at) {
            (Some(rules), Some(expires_at)) if now < expires_at => Some(rules.as_str()),
            _ => None,
        }
    }
}
