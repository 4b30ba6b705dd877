/// Checks if a domain matches a wildcard pattern
///
/// Two kinds of patterns are supported:
/// 1. Exact match: "example.com" matches only "example.com"
/// 2. Wildcard match: "*.example.com" matches "example.com" and any subdomain of it
///
/// # Examples
///
/// ```
/// use driftnet::url::matches_wildcard;
///
/// assert!(matches_wildcard("example.com", "example.com"));
/// assert!(!matches_wildcard("example.com", "other.com"));
/// assert!(matches_wildcard("*.example.com", "api.v2.example.com"));
/// assert!(!matches_wildcard("*.example.com", "badexample.com"));
/// ```
pub fn matches_wildcard(pattern: &str, candidate: &str) -> bool {
    if let Some(base) = pattern.strip_prefix("*.") {
        candidate == base
            || candidate
                .strip_suffix(base)
                .is_some_and(|prefix| prefix.ends_with('.'))
    } else {
        candidate == pattern
    }
}

/// Set of domain patterns that discovered links must match
///
/// An empty set allows every domain. A leading `www.` on the candidate is ignored, so
/// "example.com" also admits "www.example.com".
#[derive(Debug, Clone, Default)]
pub struct AllowedDomains {
    patterns: Vec<String>,
}

impl AllowedDomains {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn allows(&self, domain: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }

        let domain = domain.to_lowercase();
        let bare = domain.strip_prefix("www.").unwrap_or(&domain);

        self.patterns
            .iter()
            .any(|pattern| matches_wildcard(pattern, &domain) || matches_wildcard(pattern, bare))
    }
}
