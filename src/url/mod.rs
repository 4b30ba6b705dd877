//! URL handling: normalization into dedup keys, domain extraction and allowed-domain matching

mod domain;
mod matcher;
mod normalize;

pub use domain::{extract_domain, robots_url};
pub use matcher::{matches_wildcard, AllowedDomains};
pub use normalize::normalize_url;
