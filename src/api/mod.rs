//! HTTP surface: the client-facing listener and the admin listener.

pub mod admin;
pub mod auth;
pub mod client;
pub mod metrics;
pub mod rate_limit;
pub mod request_id;
