//! Routegate - a reverse proxy whose routing table lives in a store
//!
//! This library provides:
//! - A plain HTTP listener that routes by Host header
//! - A TLS listener that routes by SNI, either relaying the encrypted bytes
//!   (passthrough) or terminating TLS with the record's certificate
//! - Routing records and operator credentials persisted in an embedded store
//! - A token-authenticated control API on a TLS-only admin listener
//! - Connection pooling for backend communication and graceful drain on shutdown

pub mod admin;
pub mod api;
pub mod auth;
pub mod certs;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod operators;
pub mod password;
pub mod pool;
pub mod proxy;
pub mod records;
pub mod relay;
pub mod sni;
pub mod tls_proxy;
