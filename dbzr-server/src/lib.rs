//! DBzr Server
//!
//! Serves the control directories under one root over TCP, one smart
//! protocol frame per request and per response.

pub mod config;
pub mod listener;

pub use config::ServerConfig;
pub use listener::{serve, serve_connection};
