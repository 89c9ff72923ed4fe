//! Wire-level git commands and the access each one needs.

use std::fmt;

use crate::auth::access::AccessMode;
use crate::error::GatewayError;

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// The git services reachable over either transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitService {
    UploadPack,
    UploadArchive,
    ReceivePack,
}

impl GitService {
    /// Parse a wire verb such as `git-upload-pack`. Anything outside the
    /// three known verbs is an error.
    pub fn from_verb(verb: &str) -> Result<Self, GatewayError> {
        match verb {
            "git-upload-pack" => Ok(GitService::UploadPack),
            "git-upload-archive" => Ok(GitService::UploadArchive),
            "git-receive-pack" => Ok(GitService::ReceivePack),
            other => Err(GatewayError::ProtocolMalformed(format!(
                "unknown git command '{other}'"
            ))),
        }
    }

    /// Parse the HTTP form (`upload-pack`, `receive-pack`). Archives are not
    /// served over smart HTTP.
    pub fn from_http_service(name: &str) -> Option<Self> {
        match name {
            "upload-pack" => Some(GitService::UploadPack),
            "receive-pack" => Some(GitService::ReceivePack),
            _ => None,
        }
    }

    /// Access mode this service requires.
    pub fn required_mode(self) -> AccessMode {
        match self {
            GitService::UploadPack | GitService::UploadArchive => AccessMode::Read,
            GitService::ReceivePack => AccessMode::Write,
        }
    }

    /// Subcommand name passed to the git binary.
    pub fn subcommand(self) -> &'static str {
        match self {
            GitService::UploadPack => "upload-pack",
            GitService::UploadArchive => "upload-archive",
            GitService::ReceivePack => "receive-pack",
        }
    }

    pub fn is_write(self) -> bool {
        self.required_mode() == AccessMode::Write
    }
}

impl fmt::Display for GitService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "git-{}", self.subcommand())
    }
}

// ---------------------------------------------------------------------------
// SSH command strings
// ---------------------------------------------------------------------------

/// Drop everything before the first literal `git`, so `sh -c 'git-upload-pack ...'`
/// style prefixes never reach the dispatcher. No `git` at all yields `""`.
pub fn clean_command(cmd: &str) -> &str {
    match cmd.find("git") {
        Some(idx) => &cmd[idx..],
        None => "",
    }
}

/// Owner and repository named by a command or URL path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
    pub is_wiki: bool,
}

impl RepoRef {
    /// Parse `owner/name[.git]` or `owner/name.wiki[.git]`. Lower-cases both
    /// parts and tolerates one leading `/`.
    pub fn parse(path: &str) -> Result<Self, GatewayError> {
        let path = path.strip_prefix('/').unwrap_or(path).to_lowercase();
        let Some((owner, rest)) = path.split_once('/') else {
            return Err(GatewayError::ProtocolMalformed(format!(
                "invalid repository path '{path}'"
            )));
        };
        let name = rest.strip_suffix(".git").unwrap_or(rest);
        let (name, is_wiki) = match name.strip_suffix(".wiki") {
            Some(base) => (base, true),
            None => (name, false),
        };
        if owner.is_empty() || name.is_empty() || name.contains('/') || owner == ".." || name == ".." {
            return Err(GatewayError::ProtocolMalformed(format!(
                "invalid repository path '{path}'"
            )));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            is_wiki,
        })
    }
}

/// A parsed `SSH_ORIGINAL_COMMAND`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCommand {
    pub service: GitService,
    pub repo: RepoRef,
}

/// Split `verb 'owner/repo.git'` into its parts. The verb is checked before
/// the path so an unknown verb is reported as such.
pub fn parse_ssh_command(cmd: &str) -> Result<SshCommand, GatewayError> {
    let Some((verb, arg)) = cmd.trim().split_once(' ') else {
        return Err(GatewayError::ProtocolMalformed(format!(
            "malformed command '{cmd}'"
        )));
    };
    let service = GitService::from_verb(verb)?;
    let arg = arg.trim();
    let arg = arg
        .strip_prefix('\'')
        .and_then(|a| a.strip_suffix('\''))
        .unwrap_or(arg);
    let repo = RepoRef::parse(arg)?;
    Ok(SshCommand { service, repo })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_verb_maps_to_a_mode() {
        let table = [
            ("git-upload-pack", AccessMode::Read),
            ("git-upload-archive", AccessMode::Read),
            ("git-receive-pack", AccessMode::Write),
        ];
        for (verb, mode) in table {
            let service = GitService::from_verb(verb).unwrap();
            assert_eq!(service.required_mode(), mode);
            assert_eq!(service.to_string(), verb);
        }
        for verb in ["git-shell", "rm", "", "git upload-pack", "GIT-UPLOAD-PACK"] {
            assert!(matches!(
                GitService::from_verb(verb),
                Err(GatewayError::ProtocolMalformed(_))
            ));
        }
    }

    #[test]
    fn clean_command_strips_prefix() {
        assert_eq!(
            clean_command("sh -c git-upload-pack 'a/b.git'"),
            "git-upload-pack 'a/b.git'"
        );
        assert_eq!(clean_command("git-receive-pack 'a/b'"), "git-receive-pack 'a/b'");
        assert_eq!(clean_command("ls -la"), "");
    }

    #[test]
    fn parse_quoted_paths() {
        let cmd = parse_ssh_command("git-receive-pack 'Alice/Repo.git'").unwrap();
        assert_eq!(cmd.service, GitService::ReceivePack);
        assert_eq!(cmd.repo.owner, "alice");
        assert_eq!(cmd.repo.name, "repo");
        assert!(!cmd.repo.is_wiki);

        let cmd = parse_ssh_command("git-upload-pack '/alice/repo.wiki.git'").unwrap();
        assert_eq!(cmd.repo.name, "repo");
        assert!(cmd.repo.is_wiki);

        let cmd = parse_ssh_command("git-upload-archive alice/repo").unwrap();
        assert_eq!(cmd.service, GitService::UploadArchive);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(parse_ssh_command("git-upload-pack").is_err());
        assert!(parse_ssh_command("git-upload-pack 'noslash'").is_err());
        assert!(parse_ssh_command("git-upload-pack 'a/b/c.git'").is_err());
        assert!(parse_ssh_command("git-upload-pack '../etc.git'").is_err());
        assert!(parse_ssh_command("git-upload-pack 'alice/..'").is_err());
        assert!(parse_ssh_command("git-frobnicate 'a/b.git'").is_err());
    }

    #[test]
    fn http_services() {
        assert_eq!(
            GitService::from_http_service("upload-pack"),
            Some(GitService::UploadPack)
        );
        assert_eq!(GitService::from_http_service("upload-archive"), None);
    }
}
