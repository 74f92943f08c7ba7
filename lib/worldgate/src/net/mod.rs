//! Socket-facing half of the server: non-blocking transport management,
//! incremental frame assembly and the per-connection state machine.

pub mod auth;
pub mod buffer;
pub mod codec;
pub mod compress;
pub mod connection;
pub mod sockmgr;
pub mod support;
