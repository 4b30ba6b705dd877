use crate::UrlError;
use url::Url;

/// Extracts the domain key from a URL
///
/// The key is the lowercase host. Ports are not part of it, so `example.com:8080` and
/// `example.com` share one politeness slot.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use driftnet::url::extract_domain;
///
/// let url = Url::parse("https://EXAMPLE.COM/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Returns the robots.txt location for the site serving `url`
pub fn robots_url(url: &Url) -> Result<Url, UrlError> {
    let mut robots = url
        .join("/robots.txt")
        .map_err(|e| UrlError::Malformed(format!("Cannot build robots.txt URL: {}", e)))?;
    robots.set_query(None);
    robots.set_fragment(None);
    Ok(robots)
}
