//! boardsync server library.
//!
//! Exposes the server for use in tests and embedding. Each workspace is
//! served by a single sequencer actor that orders, persists and fans out
//! board operations; the axum layer in [`server`] authenticates requests and
//! forwards them to the right actor.

pub mod auth;
pub mod config;
pub mod hub;
pub mod sequencer;
pub mod server;
pub mod storage;
