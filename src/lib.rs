//! Turnstile - Request Admission Control
//!
//! This crate decides, per request, whether to admit or reject traffic. Each
//! request is limited by its client IP or, when it presents a configured
//! access token, by that token, using a fixed one-second window and a
//! separately timed block. Counters and blocks live in a pluggable store:
//! in process memory, or in Redis so several instances share one view.

pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
