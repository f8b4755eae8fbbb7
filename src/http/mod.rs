//! Git Smart-HTTP transport.
//!
//! This module provides the axum-based HTTP server that answers ref
//! advertisements and stateless-RPC pack exchanges by running the Git service
//! binaries against repositories under the configured root.

pub mod handler;

pub use handler::{create_router, serve};
