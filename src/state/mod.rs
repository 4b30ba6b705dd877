//! State module for the records the scheduler keeps in the shared store
//!
//! # Components
//!
//! - `FrontierEntry`: a URL waiting in the frontier with its ready time and priority
//! - `RetryState`: transient-failure attempts recorded for a URL
//! - `DomainState`: per-domain politeness and robots.txt record
//! - `Outcome`: how one pipeline iteration ended for a claimed URL

mod domain_state;
mod entry;
mod outcome;

pub use domain_state::DomainState;
pub use entry::{FrontierEntry, RetryState};
pub use outcome::Outcome;
