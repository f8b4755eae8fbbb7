//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`]. The
//! handler authenticates public keys against the `authorized_keys` set loaded
//! at startup, then runs one Git service per `exec` request with the channel
//! wired to the child's stdio.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use base64::Engine as _;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::SinkExt;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::{ChannelWriter, SSH_EXTENDED_DATA_STDERR};
use super::drain::SessionCounter;
use super::keys::AuthorizedKeys;
use crate::git::{parse_ssh_command, GatewayError, Invocation, ServiceRequest};
use crate::AppState;

/// Client data chunks queued per channel before the connection stops
/// reading from the client.
const STDIN_QUEUE: usize = 1024;

type StdinReader = StreamReader<mpsc::Receiver<io::Result<Bytes>>, Bytes>;

/// Sending half of a service's stdin. The queue is bounded, so a service
/// that stops reading eventually stalls the client instead of growing the
/// queue without limit.
struct StdinPipe {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl StdinPipe {
    /// Queue `data`, waiting for room. Returns `false` once the reading
    /// side is gone.
    async fn push(&mut self, data: &[u8]) -> bool {
        self.tx.send(Ok(Bytes::copy_from_slice(data))).await.is_ok()
    }
}

fn stdin_pipe(capacity: usize) -> (StdinPipe, StdinReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (StdinPipe { tx }, StreamReader::new(rx))
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    keys: Arc<AuthorizedKeys>,
    sessions: SessionCounter,
    peer_addr: Option<SocketAddr>,
    fingerprint: Option<String>,
    /// `GIT_PROTOCOL` value sent by the client via SSH env request.
    git_protocol: Option<String>,
    /// Client input for running services, keyed by channel. Dropping a pipe
    /// ends the child's stdin.
    stdin: HashMap<ChannelId, StdinPipe>,
}

impl SshSession {
    pub fn new(
        state: Arc<AppState>,
        keys: Arc<AuthorizedKeys>,
        sessions: SessionCounter,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            state,
            keys,
            sessions,
            peer_addr,
            fingerprint: None,
            git_protocol: None,
            stdin: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel close helpers
// ---------------------------------------------------------------------------

/// Send exit-status, EOF, and close on a channel in the order required by
/// the SSH protocol (RFC 4254). Git's SSH transport client expects all three
/// signals; omitting exit-status or EOF causes the client to treat the channel
/// close as a transport failure ("the remote end hung up unexpectedly").
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

/// [`finish_channel`] from outside the handler, once the service has exited.
async fn finish_channel_async(handle: &Handle, channel_id: ChannelId, exit_status: u32) {
    let _ = handle.exit_status_request(channel_id, exit_status).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
}

// ---------------------------------------------------------------------------
// Fingerprint helper
// ---------------------------------------------------------------------------

/// Compute the SHA-256 fingerprint of an SSH public key, returned as a
/// base64-encoded string prefixed with `SHA256:` (matching the format used by
/// `ssh-keygen -l`).
fn fingerprint_of(key: &PublicKey) -> String {
    let hash = Sha256::digest(key.public_key_bytes());
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

// ---------------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------------

/// Run one SSH exec command to completion and return the exit status to
/// report on the channel.
///
/// Diagnostics for the client go to `stderr`; the service's own output is
/// copied into `stdout` and `stderr` untouched.
pub async fn run_exec<I, O, E>(
    state: &AppState,
    cancel: &CancellationToken,
    command: &str,
    git_protocol: Option<String>,
    stdin: I,
    stdout: O,
    mut stderr: E,
) -> u32
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let request = match parse_ssh_command(command) {
        Ok(request) => request.with_protocol_version(git_protocol),
        Err(e) => {
            warn!(%command, error = %e, "rejected SSH exec command");
            report(&mut stderr, &format!("invalid command: {e}")).await;
            return 1;
        }
    };

    let raw_path = request.repo_path.to_string_lossy().into_owned();
    let repo_path = match state.repo_root.locate(&raw_path).await {
        Ok(path) => path,
        Err(e @ GatewayError::RepositoryNotFound(_)) => {
            warn!(repo = %raw_path, "repository not found");
            report(&mut stderr, &e.to_string()).await;
            return 1;
        }
        Err(e) => {
            warn!(repo = %raw_path, error = %e, "rejected repository path");
            report(&mut stderr, &format!("invalid repo path: {e}")).await;
            return 1;
        }
    };

    let request = ServiceRequest {
        repo_path,
        ..request
    };
    info!(
        service = %request.service,
        repo = %request.repo_path.display(),
        protocol = ?request.protocol_version,
        "running git service over SSH"
    );

    match state
        .executor
        .serve(cancel, &request, Invocation::Direct, stdin, stdout, &mut stderr)
        .await
    {
        Ok(()) => 0,
        Err(e) => {
            warn!(service = %request.service, error = %e, "git service failed");
            report(&mut stderr, &format!("git service failed: {e}")).await;
            1
        }
    }
}

/// Best-effort diagnostic line on the client's stderr.
async fn report<E: AsyncWrite + Unpin>(stderr: &mut E, message: &str) {
    let line = format!("{message}\n");
    if stderr.write_all(line.as_bytes()).await.is_ok() {
        let _ = stderr.flush().await;
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Accept a key iff its wire encoding is in the authorized set.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fp = fingerprint_of(key);

        if self.keys.is_authorized(key) {
            info!(
                peer = ?self.peer_addr,
                user = %user,
                fingerprint = %fp,
                "SSH public-key auth accepted"
            );
            self.fingerprint = Some(fp);
            return Ok(Auth::Accept);
        }

        warn!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %fp,
            error = %GatewayError::AuthenticationFailure,
            "SSH public-key auth rejected"
        );
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Capture environment variables sent by the client before the exec
    /// request. Git clients send `GIT_PROTOCOL=version=2` here to negotiate
    /// protocol v2.
    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.git_protocol = Some(variable_value.to_string());
        }
        Ok(())
    }

    /// Forward client data to the running service's stdin. Waits while the
    /// service's queue is full.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pipe) = self.stdin.get_mut(&channel) {
            if !pipe.push(data).await {
                debug!("git service stdin closed (process may have exited)");
                self.stdin.remove(&channel);
            }
        }
        Ok(())
    }

    /// When the client signals EOF, close the service's stdin so it knows the
    /// negotiation is complete and can exit.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdin.remove(&channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdin.remove(&channel);
        Ok(())
    }

    /// Interactive logins are not offered.
    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(peer = ?self.peer_addr, "refused interactive shell request");
        session.extended_data(
            channel_id,
            SSH_EXTENDED_DATA_STDERR,
            CryptoVec::from_slice(b"interactive shell access is not supported\n"),
        );
        finish_channel(session, channel_id, 1);
        Ok(())
    }

    /// Handle `exec` requests on an established channel.
    ///
    /// The service runs in a background task; the handler returns at once so
    /// the connection keeps processing client data.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        info!(
            peer = ?self.peer_addr,
            fingerprint = ?self.fingerprint,
            command = %command,
            "SSH exec request"
        );
        session.channel_success(channel_id);

        let (pipe, stdin) = stdin_pipe(STDIN_QUEUE);
        self.stdin.insert(channel_id, pipe);

        let guard = self.sessions.enter();
        let handle = session.handle();
        let state = Arc::clone(&self.state);
        let git_protocol = self.git_protocol.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let cancel = state.terminate.child_token();
            let stdout = ChannelWriter::data(handle.clone(), channel_id);
            let stderr = ChannelWriter::stderr(handle.clone(), channel_id);

            let exit_status = run_exec(
                &state,
                &cancel,
                &command,
                git_protocol,
                stdin,
                stdout,
                stderr,
            )
            .await;

            debug!(exit_status, "SSH exec finished");
            finish_channel_async(&handle, channel_id, exit_status).await;
        });

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
