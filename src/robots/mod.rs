//! Robots.txt handling module
//!
//! Parsing and matching live in [`ParsedRobots`]; [`RobotsCache`] keeps rules in the shared
//! store with an expiry and coordinates which worker fetches them.

mod cache;
mod parser;

pub use cache::{RobotsCache, RobotsLookup, RobotsVerdict};
pub use parser::ParsedRobots;
