//! Observability: Prometheus metrics served by the HTTP server.

pub mod metrics;
