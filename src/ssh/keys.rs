//! Host key and `authorized_keys` loading.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use tracing::info;

/// Public keys allowed to connect, stored by their wire encoding.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    keys: HashSet<Vec<u8>>,
}

impl AuthorizedKeys {
    /// Load an OpenSSH `authorized_keys` file. Any malformed line, or a file
    /// with no keys at all, is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read authorized keys: {}", path.display()))?;
        let keys = Self::parse(&contents)
            .with_context(|| format!("invalid authorized keys file: {}", path.display()))?;
        info!(path = %path.display(), count = keys.len(), "loaded authorized keys");
        Ok(keys)
    }

    /// Parse `authorized_keys` text. Leading options and trailing comments
    /// are ignored.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut keys = HashSet::new();

        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut tokens = line.split_whitespace();
            tokens
                .by_ref()
                .find(|t| is_key_type(t))
                .with_context(|| format!("line {}: no public key type found", idx + 1))?;
            let blob = tokens
                .next()
                .with_context(|| format!("line {}: missing key data", idx + 1))?;
            let key = russh_keys::parse_public_key_base64(blob)
                .with_context(|| format!("line {}: invalid public key", idx + 1))?;

            keys.insert(key.public_key_bytes());
        }

        anyhow::ensure!(!keys.is_empty(), "no authorized keys found");
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.keys.contains(&key.public_key_bytes())
    }
}

fn is_key_type(token: &str) -> bool {
    ["ssh-", "ecdsa-sha2-", "sk-ssh-", "sk-ecdsa-"]
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

/// Load the server's private host key.
pub fn load_host_key(path: &Path) -> Result<KeyPair> {
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("failed to load SSH host key: {}", path.display()))
}
