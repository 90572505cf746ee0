//! HTTP surface: routing-layer middleware and the decision service.

mod middleware;
mod server;
mod service;

pub use middleware::{client_identifier, enforce_rate_limit, RateLimitGuard};
pub use server::HttpServer;
pub use service::{router, AppState, CheckRequest, CheckResponse, PolicyBody};
