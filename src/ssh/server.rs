//! SSH server bootstrap, the [`russh::server::Server`] implementation and
//! the drain-on-shutdown accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::drain::SessionCounter;
use super::keys::AuthorizedKeys;
use super::session::SshSession;
use crate::AppState;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    state: Arc<AppState>,
    keys: Arc<AuthorizedKeys>,
    sessions: SessionCounter,
}

impl SshServer {
    pub fn new(state: Arc<AppState>, keys: Arc<AuthorizedKeys>) -> Self {
        Self {
            state,
            keys,
            sessions: SessionCounter::new(),
        }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH client connection");
        SshSession::new(
            Arc::clone(&self.state),
            Arc::clone(&self.keys),
            self.sessions.clone(),
            peer_addr,
        )
    }
}

// ---------------------------------------------------------------------------
// russh config
// ---------------------------------------------------------------------------

/// Public-key only, with the host key loaded at startup.
pub fn server_config(host_key: KeyPair, inactivity_timeout: Duration) -> server::Config {
    server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        inactivity_timeout: Some(inactivity_timeout),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: 3,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Serve SSH on `listener` until the shutdown token fires.
///
/// The listener is closed as soon as shutdown starts. Running sessions then
/// get the configured grace period; whatever is left after it is killed via
/// the termination token.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    config: Arc<server::Config>,
    keys: Arc<AuthorizedKeys>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "SSH server listening");
    }

    let shutdown = state.shutdown.clone();
    let terminate = state.terminate.clone();
    let grace = state.config.shutdown.grace_period();

    let mut ssh_server = SshServer::new(state, keys);
    let sessions = ssh_server.sessions.clone();

    accept_until(listener, &shutdown, |stream, peer| {
        let handler = ssh_server.new_client(Some(peer));
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            let session = match server::run_stream(config, stream, handler).await {
                Ok(session) => session,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "SSH handshake failed");
                    return;
                }
            };
            if let Err(e) = session.await {
                debug!(peer = %peer, error = %e, "SSH connection closed with error");
            }
        });
    })
    .await;

    info!(active = sessions.active(), ?grace, "SSH listener closed; draining sessions");
    if sessions.drain(grace).await {
        info!("SSH sessions drained");
    } else {
        warn!(
            remaining = sessions.active(),
            "SSH sessions still running after grace period; terminating"
        );
        terminate.cancel();
    }

    Ok(())
}

/// Accept connections until `shutdown` fires, then drop the listener so
/// further connection attempts are refused.
async fn accept_until<F>(listener: TcpListener, shutdown: &CancellationToken, mut on_accept: F)
where
    F: FnMut(TcpStream, SocketAddr),
{
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => on_accept(stream, peer),
                Err(e) => {
                    warn!(error = %e, "failed to accept SSH connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    drop(listener);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
