use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use gitgate::ssh::{load_host_key, server_config, AuthorizedKeys};
use gitgate::{config, http, ssh, AppState};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitgate", about = "Git SSH and Smart-HTTP gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/gitgate/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting gitgate");

    // ---- Ensure repository root exists ----
    tokio::fs::create_dir_all(&config.repo_root)
        .await
        .with_context(|| {
            format!(
                "failed to create repo root: {}",
                config.repo_root.display()
            )
        })?;

    // ---- App state ----
    let state = Arc::new(AppState::new(config)?);
    tracing::info!(repo_root = %state.repo_root.path().display(), "repository root ready");

    // ---- Bind listeners and load keys before serving anything ----
    let http_listener = match state.config.http {
        Some(ref http) => Some(
            TcpListener::bind(http.listen.as_str())
                .await
                .with_context(|| format!("failed to bind HTTP listener on {}", http.listen))?,
        ),
        None => None,
    };

    let ssh_setup = match state.config.ssh {
        Some(ref ssh) => {
            let keys = AuthorizedKeys::load(&ssh.authorized_keys_path)?;
            let host_key = load_host_key(&ssh.host_key_path)?;
            let listener = TcpListener::bind(ssh.listen.as_str())
                .await
                .with_context(|| format!("failed to bind SSH listener on {}", ssh.listen))?;
            let russh_config = server_config(host_key, ssh.inactivity_timeout());
            Some((listener, Arc::new(russh_config), Arc::new(keys)))
        }
        None => None,
    };

    // ---- Spawn services ----
    let mut handles = Vec::new();

    if let Some(listener) = http_listener {
        handles.push(tokio::spawn({
            let s = Arc::clone(&state);
            async move {
                if let Err(e) = http::serve(listener, s).await {
                    tracing::error!(error = %e, "HTTP server failed");
                }
            }
        }));
    }

    if let Some((listener, russh_config, keys)) = ssh_setup {
        handles.push(tokio::spawn({
            let s = Arc::clone(&state);
            async move {
                if let Err(e) = ssh::serve(listener, s, russh_config, keys).await {
                    tracing::error!(error = %e, "SSH server failed");
                }
            }
        }));
    }

    // ---- Await shutdown ----
    let servers = join_all(handles);
    tokio::pin!(servers);

    let signalled = tokio::select! {
        () = shutdown_signal() => true,
        _ = &mut servers => false,
    };

    if signalled {
        state.shutdown.cancel();
        // Each server closes its listener and drains within the grace period.
        let _ = servers.await;
    } else {
        tracing::warn!("all servers exited before a shutdown signal");
    }

    state.terminate.cancel();
    tracing::info!("gitgate shut down cleanly");
    Ok(())
}
