//! Runs `git-upload-pack` / `git-receive-pack` for a validated request and
//! pumps the caller's streams through the child process.
//!
//! The child is spawned with `kill_on_drop`, so abandoning the exchange
//! (cancellation, client disconnect) always takes the process down with it.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::error::{ExecError, GatewayError};
use super::service::{Service, ServiceRequest};
use crate::config::GitConfig;

/// Environment variable Git inspects to pick the wire protocol version.
pub const GIT_PROTOCOL_ENV: &str = "GIT_PROTOCOL";

/// How the service binary is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// `git-upload-pack <repo>`, as over SSH.
    Direct,
    /// `--stateless-rpc <repo>`, one Smart-HTTP request/response round.
    StatelessRpc,
    /// `--stateless-rpc --advertise-refs <repo>`, the `info/refs` listing.
    AdvertiseRefs,
}

impl Invocation {
    pub fn flags(self) -> &'static [&'static str] {
        match self {
            Invocation::Direct => &[],
            Invocation::StatelessRpc => &["--stateless-rpc"],
            Invocation::AdvertiseRefs => &["--stateless-rpc", "--advertise-refs"],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceExecutor {
    upload_pack: Option<PathBuf>,
    receive_pack: Option<PathBuf>,
    env: BTreeMap<String, String>,
    work_dir: Option<PathBuf>,
}

impl ServiceExecutor {
    pub fn from_config(config: &GitConfig) -> Self {
        Self {
            upload_pack: config.upload_pack_path.clone(),
            receive_pack: config.receive_pack_path.clone(),
            env: config.extra_env.clone(),
            work_dir: config.work_dir.clone(),
        }
    }

    /// Configured override, or the canonical command name looked up on `PATH`.
    pub fn binary(&self, service: Service) -> PathBuf {
        let configured = match service {
            Service::UploadPack => &self.upload_pack,
            Service::ReceivePack => &self.receive_pack,
        };
        configured
            .clone()
            .unwrap_or_else(|| PathBuf::from(service.command()))
    }

    /// Build the child command. The repository path is always the single
    /// positional argument, after the invocation flags.
    pub fn command(&self, request: &ServiceRequest, invocation: Invocation) -> Command {
        let mut cmd = Command::new(self.binary(request.service));
        cmd.args(invocation.flags()).arg(&request.repo_path);

        cmd.envs(&self.env);
        if let Some(ref version) = request.protocol_version {
            cmd.env(GIT_PROTOCOL_ENV, version);
        }
        if let Some(ref dir) = self.work_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run the service to completion.
    ///
    /// `stdin` feeds the child's input; the child's stdout and stderr are
    /// copied into `stdout` and `stderr`. Returns once the child has exited
    /// and its output is fully written, or as soon as `cancel` fires.
    #[instrument(
        skip_all,
        fields(service = %request.service, repo = %request.repo_path.display(), ?invocation)
    )]
    pub async fn serve<I, O, E>(
        &self,
        cancel: &CancellationToken,
        request: &ServiceRequest,
        invocation: Invocation,
        stdin: I,
        stdout: O,
        stderr: E,
    ) -> Result<(), GatewayError>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        request.validate()?;

        let binary = self.binary(request.service).display().to_string();
        let child = self
            .command(request, invocation)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                binary: binary.clone(),
                source,
            })?;
        debug!(pid = ?child.id(), %binary, "spawned git service");

        let status = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                warn!(%binary, "git service cancelled; killing child");
                return Err(ExecError::Cancelled.into());
            }
            status = exchange(child, stdin, stdout, stderr) => status.map_err(ExecError::Io)?,
        };

        if !status.success() {
            return Err(ExecError::Exit { binary, status }.into());
        }

        debug!(%status, "git service finished");
        Ok(())
    }
}

/// Pump bytes until the child closes its output, then reap it.
///
/// Input is fed concurrently but never waited on: a service that exits
/// without consuming all of its input must not hang on a client that keeps
/// its side open.
async fn exchange<I, O, E>(
    mut child: Child,
    mut stdin: I,
    mut stdout: O,
    mut stderr: E,
) -> io::Result<ExitStatus>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let child_stdin = child.stdin.take();
    let mut child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("git service stdout was not captured"))?;
    let mut child_stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("git service stderr was not captured"))?;

    {
        let feed = async {
            if let Some(mut sink) = child_stdin {
                if let Err(e) = tokio::io::copy(&mut stdin, &mut sink).await {
                    debug!(error = %e, "failed to write to git service stdin (process may have exited)");
                }
                // Dropping the sink closes the pipe, signalling EOF to the child.
            }
        };
        // The first failing copy ends the exchange, so the child is dropped
        // (and killed) instead of blocking on a pipe nobody reads anymore.
        let drain = async {
            tokio::try_join!(
                tokio::io::copy(&mut child_stdout, &mut stdout),
                tokio::io::copy(&mut child_stderr, &mut stderr),
            )?;
            Ok::<_, io::Error>(())
        };
        tokio::pin!(feed, drain);

        let mut fed = false;
        loop {
            tokio::select! {
                () = &mut feed, if !fed => fed = true,
                res = &mut drain => {
                    res?;
                    break;
                }
            }
        }
    }

    child.wait().await
}
