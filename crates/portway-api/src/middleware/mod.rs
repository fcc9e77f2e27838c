//! API Middleware
//!
//! Request admission layers applied in front of every route.

pub mod rate_limit;

pub use rate_limit::{client_identity, enforce_rate_limit};
