//! SSH transport for the Git gateway.
//!
//! Accepts SSH connections from Git clients, authenticates them against a
//! static `authorized_keys` file, and runs `git-upload-pack` /
//! `git-receive-pack` for the repository named in the exec command. On
//! shutdown the listener closes first and running sessions are drained.

pub mod channel;
pub mod drain;
pub mod keys;
pub mod server;
pub mod session;

pub use keys::{load_host_key, AuthorizedKeys};
pub use server::{serve, server_config};
