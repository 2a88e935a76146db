//! Mari API Library Crate
//!
//! The HTTP service behind the one-shot lesson calls: configuration, shared
//! state, handlers and routing. The `api` binary is a thin wrapper around it.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
