//! Introspection server wiring.

pub mod server;

pub use server::{install_prometheus_recorder, GatewayServer};
