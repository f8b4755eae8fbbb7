//! Parsing of the exec command an SSH Git client sends, e.g.
//!
//! ```text
//! git-upload-pack '/var/repos/foo.git'
//! git-receive-pack "owner/repo.git"
//! ```

use super::error::{GatewayError, ParseError};
use super::service::ServiceRequest;

/// Parse an SSH exec command into a validated [`ServiceRequest`].
///
/// Only surrounding quotes are stripped from the path token. Quoted paths
/// containing spaces or escaped quotes are not supported.
pub fn parse_ssh_command(command: &str) -> Result<ServiceRequest, GatewayError> {
    let raw = command.trim();
    if raw.is_empty() {
        return Err(ParseError::EmptyCommand.into());
    }

    let mut fields = raw.split_whitespace();
    let (Some(service), Some(repo_token)) = (fields.next(), fields.next()) else {
        return Err(ParseError::InvalidCommand(raw.to_string()).into());
    };

    let repo_path = repo_token.trim_matches(|c| c == '\'' || c == '"');
    ServiceRequest::parse(service, repo_path)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::git::service::Service;

    #[test]
    fn parses_single_quoted_upload_pack() {
        let req = parse_ssh_command("git-upload-pack '/a/b.git'").unwrap();
        assert_eq!(req.service, Service::UploadPack);
        assert_eq!(req.repo_path, PathBuf::from("/a/b.git"));
        assert_eq!(req.protocol_version, None);
    }

    #[test]
    fn parses_double_quoted_and_unquoted() {
        let req = parse_ssh_command("  git-receive-pack \"owner/repo.git\"\n").unwrap();
        assert_eq!(req.service, Service::ReceivePack);
        assert_eq!(req.repo_path, PathBuf::from("owner/repo.git"));

        let req = parse_ssh_command("git-upload-pack owner/repo.git").unwrap();
        assert_eq!(req.repo_path, PathBuf::from("owner/repo.git"));
    }

    #[test]
    fn rejects_empty_and_single_token() {
        assert!(matches!(
            parse_ssh_command("   "),
            Err(GatewayError::Parse(ParseError::EmptyCommand))
        ));
        assert!(matches!(
            parse_ssh_command("git-upload-pack"),
            Err(GatewayError::Parse(ParseError::InvalidCommand(_)))
        ));
    }

    #[test]
    fn rejects_services_outside_the_closed_set() {
        assert!(matches!(
            parse_ssh_command("git-upload-archive '/a.git'"),
            Err(GatewayError::UnsupportedService(s)) if s == "git-upload-archive"
        ));
        assert!(matches!(
            parse_ssh_command("rm -rf /"),
            Err(GatewayError::UnsupportedService(_))
        ));
    }

    #[test]
    fn rejects_quotes_only_path() {
        assert!(matches!(
            parse_ssh_command("git-upload-pack ''"),
            Err(GatewayError::MissingRepoPath)
        ));
    }

    #[test]
    fn paths_with_spaces_are_truncated_at_the_first_space() {
        // Known limitation: the path token ends at the first whitespace.
        let req = parse_ssh_command("git-upload-pack '/my repo.git'").unwrap();
        assert_eq!(req.repo_path, PathBuf::from("/my"));
    }

    #[test]
    fn embedded_quotes_are_not_unescaped() {
        let req = parse_ssh_command(r#"git-upload-pack '/a\'b.git'"#).unwrap();
        assert_eq!(req.repo_path, PathBuf::from(r"/a\'b.git"));
    }

    #[test]
    fn parsing_is_idempotent() {
        let cmd = "git-receive-pack '/x/y.git'";
        assert_eq!(parse_ssh_command(cmd).unwrap(), parse_ssh_command(cmd).unwrap());
    }
}
