//! Git remote address parsing.
//!
//! Accepts the three spellings Git itself understands:
//!
//! ```text
//! /srv/git/project.git                          local path
//! git@example.com:repo/project.git              scp-like (ssh)
//! ssh://git@example.com:2222/repo/project.git   URL
//! https://example.com/repo/project.git          URL
//! ```

use std::fmt;
use std::str::FromStr;

use url::Url;

use super::error::ParseError;
use super::paths::clean;

/// How a remote endpoint was addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Local,
    Ssh,
    Git,
    Http,
    Https,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Local => "local",
            Transport::Ssh => "ssh",
            Transport::Git => "git",
            Transport::Http => "http",
            Transport::Https => "https",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = ParseError;

    /// Parse a URL scheme. `local` is never a scheme.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" => Ok(Transport::Ssh),
            "git" => Ok(Transport::Git),
            "http" => Ok(Transport::Http),
            "https" => Ok(Transport::Https),
            _ => Err(ParseError::UnsupportedTransport(s.to_string())),
        }
    }
}

/// A parsed Git remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub transport: Transport,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Never empty. Slash-prefixed for every transport except `local`, whose
    /// path is kept exactly as given.
    pub path: String,
}

impl Endpoint {
    fn local(path: &str) -> Self {
        Self {
            transport: Transport::Local,
            user: None,
            host: None,
            port: None,
            path: path.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.transport == Transport::Local {
            return f.write_str(&self.path);
        }

        let host = self.host.as_deref().unwrap_or_default();
        let user = self.user.as_deref().map(|u| format!("{u}@")).unwrap_or_default();

        if self.transport == Transport::Ssh && self.port.is_none() {
            return write!(f, "{user}{host}:{}", self.path);
        }

        write!(f, "{}://{user}{host}", self.transport)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        f.write_str(&self.path)
    }
}

impl FromStr for Endpoint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_endpoint(s)
    }
}

/// Parse a Git URL, scp-like address or local path into an [`Endpoint`].
pub fn parse_endpoint(raw: &str) -> Result<Endpoint, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::EmptyEndpoint);
    }

    let has_scheme = raw.contains("://");

    if !has_scheme && !raw.contains('@') && !raw.contains(':') {
        return Ok(Endpoint::local(raw));
    }

    if !has_scheme {
        if let Some((user_host, repo_path)) = raw.split_once(':') {
            let (user, host) = split_user_host(user_host);
            return Ok(Endpoint {
                transport: Transport::Ssh,
                user,
                host: Some(host.to_string()),
                port: None,
                path: ensure_leading_slash(repo_path),
            });
        }
    }

    let url = Url::parse(raw)?;
    let transport: Transport = url.scheme().parse()?;

    let user = Some(url.username())
        .filter(|u| !u.is_empty())
        .map(str::to_string);
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty());

    Ok(Endpoint {
        transport,
        user,
        host,
        port: url.port(),
        path: ensure_leading_slash(&clean(url.path())),
    })
}

fn split_user_host(s: &str) -> (Option<String>, &str) {
    match s.split_once('@') {
        Some((user, host)) => (Some(user.to_string()).filter(|u| !u.is_empty()), host),
        None => (None, s),
    }
}

fn ensure_leading_slash(p: &str) -> String {
    if p.starts_with('/') {
        p.to_string()
    } else if p == "." || p.is_empty() {
        "/".to_string()
    } else {
        format!("/{p}")
    }
}
