//! HTTP surface over the dispatcher.

pub mod routes;

pub use routes::{ApiState, CALLER_KEY_HEADER, dispatch_routes, status_for};
