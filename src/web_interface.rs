//! Webhook receiver and JSON API
//!
//! - `routes`: one warp filter per endpoint plus the JSON error helpers.
//! - `types`: request and response bodies.
//! - `web_server`: composes the filters and serves them.

pub mod routes;
pub mod types;
pub mod web_server;

pub use web_server::WebServer;
