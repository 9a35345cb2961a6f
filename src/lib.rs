//! Turnstile - Request Rate Limiting
//!
//! This crate implements fixed-window request rate limiting for a web
//! application. Counters live either in process memory or in a shared Redis
//! instance; a Redis outage fails open rather than blocking traffic.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
