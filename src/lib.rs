//! Dockgate - a dynamic reverse proxy for Docker containers
//!
//! This library provides a reverse proxy that:
//! - Watches the Docker event feed and registers every started container
//!   under its name (`web1` → `web1.localhost`)
//! - Routes HTTP traffic on the left-most label of the Host header
//! - Bridges WebSocket connections frame by frame
//! - Resyncs and reconnects with backoff when the event feed drops
//! - Exposes a small management API for routes, health and launching containers

pub mod admin;
pub mod backoff;
pub mod config;
pub mod docker;
pub mod error;
pub mod events;
pub mod ingest;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod websocket;
