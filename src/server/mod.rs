//! HTTP server relaying chat completions as server-sent events.
//!
//! - [`api`]: Request types, route handlers and the router
//! - [`error`]: Failure taxonomy and its HTTP responses
//! - [`streaming`]: Upstream chunk stream → SSE frame relay
//! - [`metrics`]: Prometheus counters for relay outcomes

pub mod api;
pub mod error;
pub mod metrics;
pub mod streaming;
