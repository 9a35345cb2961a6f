//! HTTP surface for rate limit decisions.
//!
//! A caller (gateway, proxy, or application handler) asks whether a request
//! may proceed and translates a rejection into a "too many requests" reply.

mod server;
mod service;

pub use server::HttpServer;
pub use service::{router, AppState, CheckParams};
