//! Devgate - a local development reverse proxy
//!
//! This library provides a single-route reverse proxy that:
//! - Listens on one stable port and forwards every request to one backend
//! - Streams request and response bodies without buffering
//! - Tunnels WebSocket upgrades as raw byte streams
//! - Rewrites `Location` headers that leak the backend's own address
//! - Reuses backend connections through a connection pool

pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod rewrite;
pub mod route;
pub mod session;
pub mod upgrade;
