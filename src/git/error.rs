//! Error taxonomy shared by the parsers, path confinement and the executor.
//!
//! Every variant that can be produced before a subprocess is spawned is
//! resolved by the transport handlers before any filesystem or process side
//! effect happens.

use std::process::ExitStatus;

/// Malformed endpoint or SSH command.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty endpoint")]
    EmptyEndpoint,

    #[error("empty command")]
    EmptyCommand,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Failure to run the external Git service binary.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{binary} exited with {status}")]
    Exit { binary: String, status: ExitStatus },

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("unsupported service: {0}")]
    UnsupportedService(String),

    #[error("missing repository path")]
    MissingRepoPath,

    #[error("invalid path traversal")]
    PathTraversal,

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error(transparent)]
    Execution(#[from] ExecError),

    #[error("no matching authorized key")]
    AuthenticationFailure,
}

impl GatewayError {
    pub fn unsupported_service(service: &str) -> Self {
        GatewayError::UnsupportedService(service.to_string())
    }
}
