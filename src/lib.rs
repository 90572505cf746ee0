//! Turnstile - Fixed-Window Rate Limiting
//!
//! This crate implements an in-process rate limiter for protecting API routes.
//! Callers are throttled per key (typically `"<endpoint-class>:<client>"`)
//! using a fixed-window counter, with a background sweep that reclaims
//! expired counters. Axum middleware and a small decision service expose the
//! limiter to the routing layer.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
