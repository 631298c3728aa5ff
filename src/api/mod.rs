//! HTTP API Module
//!
//! Provides a REST API for coaster and wagon writes plus health checks.

mod http;

pub use http::{AppState, HttpServer};
