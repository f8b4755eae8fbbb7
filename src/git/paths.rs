//! Lexical path cleaning and repository-root confinement.
//!
//! Both transports resolve client-supplied repository paths through
//! [`RepoRoot`], so the traversal rules are identical for SSH and HTTP.

use std::io;
use std::path::{Component, Path, PathBuf};

use super::error::GatewayError;

/// Lexically clean a `/`-separated path: collapse repeated slashes, drop `.`
/// segments and resolve `..` against preceding segments.
///
/// A rooted path never climbs above `/`; a relative path keeps leading `..`
/// segments that cannot be resolved. An empty result is `.` (or `/` when
/// rooted).
pub fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Component-wise normalization of a filesystem path. `..` pops the previous
/// component and can never climb above the root of an absolute path.
pub fn normalize(path: &Path) -> PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        PathBuf::from(c.as_os_str())
    } else {
        PathBuf::new()
    };

    for component in components {
        match component {
            Component::Prefix(..) => {}
            Component::RootDir => ret.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                ret.pop();
            }
            Component::Normal(c) => ret.push(c),
        }
    }
    ret
}

/// Confine `raw` beneath `root`.
///
/// The result is either `root` itself or a path strictly below it. The check
/// is a component-wise prefix match, so a sibling such as `/srv/repos-evil`
/// never passes for a root of `/srv/repos`.
pub fn confine(root: &Path, raw: &str) -> Result<PathBuf, GatewayError> {
    let relative = clean(raw.trim_start_matches('/').trim_end_matches('/'));
    let root = normalize(root);

    let full = if relative == "." {
        root.clone()
    } else {
        normalize(&root.join(&relative))
    };

    if full.starts_with(&root) {
        Ok(full)
    } else {
        Err(GatewayError::PathTraversal)
    }
}

/// Turn the repository part of a request URL into a cleaned, slash-prefixed
/// path. `/` means no repository was named.
pub fn clean_request_path(prefix: &str) -> String {
    let cleaned = clean(prefix.trim_start_matches('/').trim_end_matches('/'));
    if cleaned == "." {
        "/".to_string()
    } else {
        format!("/{cleaned}")
    }
}

/// The directory all served repositories live under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRoot {
    path: PathBuf,
}

impl RepoRoot {
    /// Resolve `path` to an absolute, normalized root. Symlinks are not
    /// resolved.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let absolute = std::path::absolute(path.as_ref())?;
        Ok(Self {
            path: normalize(&absolute),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Confine a client path. The root itself is not a servable repository.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, GatewayError> {
        let full = confine(&self.path, raw)?;
        if full == self.path {
            return Err(GatewayError::MissingRepoPath);
        }
        Ok(full)
    }

    /// [`resolve`](Self::resolve) and require the repository to exist on disk.
    pub async fn locate(&self, raw: &str) -> Result<PathBuf, GatewayError> {
        let full = self.resolve(raw)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => Ok(full),
            _ => Err(GatewayError::RepositoryNotFound(raw.to_string())),
        }
    }
}
