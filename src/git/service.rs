//! The closed set of Git services this gateway will run, and the validated
//! request handed to the executor by both transports.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::error::GatewayError;

/// Git services reachable through the gateway.
///
/// Nothing outside these two variants is ever executed, whatever the client
/// typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    /// Wire name, which is also the canonical executable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    pub fn command(&self) -> &'static str {
        self.as_str()
    }

    /// Content type of the `info/refs` response.
    pub fn advertisement_content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-advertisement",
            Service::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// Content type of the stateless-RPC `POST` response.
    pub fn result_content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-result",
            Service::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git-upload-pack" => Ok(Service::UploadPack),
            "git-receive-pack" => Ok(Service::ReceivePack),
            _ => Err(GatewayError::unsupported_service(s)),
        }
    }
}

/// A service invocation requested by a client.
///
/// `repo_path` is the client-supplied path until a transport has confined it,
/// and the absolute on-disk path afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub service: Service,
    pub repo_path: PathBuf,
    /// Raw `GIT_PROTOCOL` value, e.g. `version=2`.
    pub protocol_version: Option<String>,
}

impl ServiceRequest {
    /// Build a request from an untrusted service token and path.
    pub fn parse(service: &str, repo_path: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let request = Self {
            service: service.parse()?,
            repo_path: repo_path.into(),
            protocol_version: None,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_protocol_version(mut self, version: Option<String>) -> Self {
        self.protocol_version = version.filter(|v| !v.is_empty());
        self
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.repo_path.as_os_str().is_empty() {
            return Err(GatewayError::MissingRepoPath);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_two_services_are_supported() {
        assert_eq!(
            "git-upload-pack".parse::<Service>().unwrap(),
            Service::UploadPack
        );
        assert_eq!(
            "git-receive-pack".parse::<Service>().unwrap(),
            Service::ReceivePack
        );
        for bad in ["git-upload-archive", "upload-pack", "GIT-UPLOAD-PACK", "", "sh"] {
            assert!(
                matches!(
                    bad.parse::<Service>(),
                    Err(GatewayError::UnsupportedService(_))
                ),
                "{bad:?} must be rejected"
            );
        }
    }

    #[test]
    fn content_types() {
        assert_eq!(
            Service::ReceivePack.advertisement_content_type(),
            "application/x-git-receive-pack-advertisement"
        );
        assert_eq!(
            Service::UploadPack.result_content_type(),
            "application/x-git-upload-pack-result"
        );
        assert_eq!(Service::UploadPack.to_string(), "git-upload-pack");
    }

    #[test]
    fn request_requires_repo_path() {
        let err = ServiceRequest::parse("git-upload-pack", "").unwrap_err();
        assert!(matches!(err, GatewayError::MissingRepoPath));

        let req = ServiceRequest::parse("git-receive-pack", "/a/b.git").unwrap();
        assert_eq!(req.service, Service::ReceivePack);
        assert_eq!(req.repo_path, PathBuf::from("/a/b.git"));
        assert_eq!(req.protocol_version, None);
    }

    #[test]
    fn empty_protocol_version_is_dropped() {
        let req = ServiceRequest::parse("git-upload-pack", "/r.git")
            .unwrap()
            .with_protocol_version(Some(String::new()));
        assert_eq!(req.protocol_version, None);

        let req = req.with_protocol_version(Some("version=2".into()));
        assert_eq!(req.protocol_version.as_deref(), Some("version=2"));
    }
}
