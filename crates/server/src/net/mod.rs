//! TCP front end: accept loop, per-connection tasks, sessions and groups.

pub mod connection;
pub mod listener;
pub mod session;
pub mod sessions;
