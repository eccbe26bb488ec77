//! Podcast Studio API Library Crate
//!
//! The HTTP and SSE surface over the realtime session manager: configuration,
//! shared state, request models, handlers and routing. The `api` binary is a
//! thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
