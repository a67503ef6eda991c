//! Gateway: central WebSocket/HTTP server, protocol dispatch, admission
//! control, presence and node registry.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Resolve auth, build the session store, tool registry and agent runtime
//! 3. Start the HTTP server (health, admin API)
//! 4. Attach the WebSocket upgrade handler
//! 5. Start the tick, TTL sweep and inbound bus tasks
//!
//! Domain logic (agents, sessions, channels) lives in other crates and is
//! invoked through the method handlers in `methods.rs` and the legacy
//! handlers in `legacy.rs`.

pub mod auth;
pub mod broadcast;
pub mod chat;
pub mod http;
pub mod legacy;
pub mod methods;
pub mod nodes;
pub mod server;
pub mod state;
pub mod stats;
pub mod ws;

pub use server::{Gateway, build_gateway_app, prepare_gateway, serve, start_gateway};
