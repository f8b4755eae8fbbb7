use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory every served repository lives under. Client paths are
    /// confined beneath it.
    pub repo_root: PathBuf,
    /// Smart-HTTP listener. Omit to disable the HTTP transport.
    #[serde(default)]
    pub http: Option<HttpConfig>,
    /// SSH listener. Omit to disable the SSH transport.
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:2222`).
    #[serde(default = "default_ssh_listen")]
    pub listen: String,
    /// OpenSSH private key presented as the server host key.
    pub host_key_path: PathBuf,
    /// OpenSSH `authorized_keys` file. Loaded once at startup.
    pub authorized_keys_path: PathBuf,
    /// Idle connections are dropped after this many seconds.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
}

fn default_ssh_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_inactivity_timeout() -> u64 {
    3600
}

impl SshConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Git service binaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitConfig {
    /// Override for `git-upload-pack`; looked up on `PATH` when unset.
    #[serde(default)]
    pub upload_pack_path: Option<PathBuf>,
    /// Override for `git-receive-pack`; looked up on `PATH` when unset.
    #[serde(default)]
    pub receive_pack_path: Option<PathBuf>,
    /// Extra environment for every spawned service, on top of the inherited one.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
    /// Working directory for spawned services.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long in-flight sessions may run after a shutdown signal before
    /// their subprocesses are killed.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
        }
    }
}

fn default_grace_period() -> u64 {
    10
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate YAML config text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.repo_root.as_os_str().is_empty(),
        "repo_root must not be empty"
    );
    anyhow::ensure!(
        config.http.is_some() || config.ssh.is_some(),
        "at least one of `http` or `ssh` must be configured"
    );
    if let Some(ref ssh) = config.ssh {
        anyhow::ensure!(
            ssh.inactivity_timeout_secs > 0,
            "ssh.inactivity_timeout_secs must be greater than zero"
        );
    }
    for key in config.git.extra_env.keys() {
        anyhow::ensure!(
            !key.is_empty() && !key.contains('='),
            "invalid git.extra_env name: {key:?}"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_http_only_config_uses_defaults() {
        let config = parse_config("repo_root: /srv/git\nhttp: {}\n").unwrap();
        assert_eq!(config.repo_root, PathBuf::from("/srv/git"));
        assert_eq!(config.http.unwrap().listen, "0.0.0.0:8080");
        assert!(config.ssh.is_none());
        assert_eq!(config.shutdown.grace_period(), Duration::from_secs(10));
        assert!(config.git.upload_pack_path.is_none());
        assert!(config.git.extra_env.is_empty());
    }

    #[test]
    fn full_config() {
        let yaml = r#"
repo_root: /srv/git
http:
  listen: 127.0.0.1:9000
ssh:
  listen: 127.0.0.1:2022
  host_key_path: /etc/gitgate/host_ed25519
  authorized_keys_path: /etc/gitgate/authorized_keys
  inactivity_timeout_secs: 60
git:
  upload_pack_path: /usr/lib/git-core/git-upload-pack
  extra_env:
    GIT_TRACE_PACKET: "1"
  work_dir: /tmp
shutdown:
  grace_period_secs: 3
"#;
        let config = parse_config(yaml).unwrap();
        let ssh = config.ssh.unwrap();
        assert_eq!(ssh.listen, "127.0.0.1:2022");
        assert_eq!(ssh.inactivity_timeout(), Duration::from_secs(60));
        assert_eq!(
            ssh.authorized_keys_path,
            PathBuf::from("/etc/gitgate/authorized_keys")
        );
        assert_eq!(
            config.git.upload_pack_path,
            Some(PathBuf::from("/usr/lib/git-core/git-upload-pack"))
        );
        assert_eq!(config.git.receive_pack_path, None);
        assert_eq!(config.git.extra_env["GIT_TRACE_PACKET"], "1");
        assert_eq!(config.shutdown.grace_period_secs, 3);
    }

    #[test]
    fn requires_a_transport() {
        let err = parse_config("repo_root: /srv/git\n").unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn ssh_requires_key_paths() {
        assert!(parse_config("repo_root: /srv/git\nssh:\n  listen: 0.0.0.0:22\n").is_err());
    }

    #[test]
    fn rejects_bad_env_names() {
        let yaml = "repo_root: /srv/git\nhttp: {}\ngit:\n  extra_env:\n    \"A=B\": x\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "repo_root: /srv/git\nhttp:\n  listen: 127.0.0.1:0\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.http.unwrap().listen, "127.0.0.1:0");

        let missing = load_config(tmp.path().join("nope.yaml")).unwrap_err();
        assert!(missing.to_string().contains("failed to read config file"));
    }
}
