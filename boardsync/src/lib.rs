//! boardsync client library: the optimistic sync engine and the connection
//! supervisor that feeds it.

pub mod config;
pub mod engine;
pub mod net;
pub mod presence;
pub mod throttle;
