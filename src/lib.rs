//! Git gateway: serves bare repositories under one root directory to Git
//! clients over SSH and Smart HTTP by running `git-upload-pack` and
//! `git-receive-pack`.

pub mod config;
pub mod git;
pub mod http;
pub mod ssh;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::git::{RepoRoot, ServiceExecutor};

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and SSH sessions.
pub struct AppState {
    pub config: Arc<Config>,
    pub repo_root: RepoRoot,
    pub executor: ServiceExecutor,
    /// Fired on SIGINT/SIGTERM: listeners stop accepting.
    pub shutdown: CancellationToken,
    /// Fired when the grace period runs out: running Git services are killed.
    pub terminate: CancellationToken,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let repo_root = RepoRoot::new(&config.repo_root).with_context(|| {
            format!("invalid repo_root: {}", config.repo_root.display())
        })?;
        let executor = ServiceExecutor::from_config(&config.git);
        Ok(Self {
            config: Arc::new(config),
            repo_root,
            executor,
            shutdown: CancellationToken::new(),
            terminate: CancellationToken::new(),
        })
    }
}
