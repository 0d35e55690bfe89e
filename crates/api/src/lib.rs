//! HTTP API: inbound chat webhook and health check.

pub mod app;
