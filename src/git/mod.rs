//! Transport-independent Git plumbing: request parsing, path confinement and
//! running the service binaries.
//!
//! Nothing in here knows about SSH channels or HTTP bodies. Both front ends
//! build a [`ServiceRequest`], confine it under a [`RepoRoot`] and hand it to
//! the [`ServiceExecutor`] with whatever streams they have.

pub mod command;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod paths;
pub mod pktline;
pub mod service;

pub use command::parse_ssh_command;
pub use endpoint::{parse_endpoint, Endpoint, Transport};
pub use error::{ExecError, GatewayError, ParseError};
pub use executor::{Invocation, ServiceExecutor};
pub use paths::RepoRoot;
pub use service::{Service, ServiceRequest};
