//! Git subprocess construction.
//!
//! Every child is spawned with `kill_on_drop`, so dropping the future or the
//! handle that owns it (client disconnect, timeout) terminates the process
//! instead of orphaning it.

use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

use super::command::GitService;
use crate::config::GitConfig;
use crate::error::GatewayError;

/// Builds and runs git invocations with the configured binary and bound.
#[derive(Debug, Clone)]
pub struct GitRunner {
    binary: String,
    timeout: Option<Duration>,
}

impl GitRunner {
    pub fn new(config: &GitConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Bare command with `kill_on_drop` set.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run `git <service> --stateless-rpc --advertise-refs <repo>` and return
    /// its raw stdout.
    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    pub async fn advertise_refs(
        &self,
        service: GitService,
        repo_path: &Path,
        git_protocol: Option<&str>,
    ) -> Result<Vec<u8>, GatewayError> {
        let mut cmd = self.command();
        cmd.arg(service.subcommand())
            .arg("--stateless-rpc")
            .arg("--advertise-refs")
            .arg(repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(proto) = git_protocol {
            cmd.env("GIT_PROTOCOL", proto);
        }

        let output = bounded(self.timeout, cmd.output())
            .await?
            .map_err(|e| GatewayError::SubprocessFailure(format!("spawn {service}: {e}")))?;
        if !output.status.success() {
            return Err(GatewayError::SubprocessFailure(format!(
                "{service} --advertise-refs exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(bytes = output.stdout.len(), "refs advertised");
        Ok(output.stdout)
    }

    /// Regenerate `info/refs` and `objects/info/packs` for dumb clients.
    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    pub async fn update_server_info(&self, repo_path: &Path) -> Result<(), GatewayError> {
        let mut cmd = self.command();
        cmd.arg("update-server-info")
            .current_dir(repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = bounded(self.timeout, cmd.output())
            .await?
            .map_err(|e| GatewayError::SubprocessFailure(format!("spawn update-server-info: {e}")))?;
        if !output.status.success() {
            return Err(GatewayError::SubprocessFailure(format!(
                "update-server-info exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Spawn `git <service> --stateless-rpc <repo>` with piped stdio. The
    /// caller owns the child and must drive both pipes.
    pub fn spawn_stateless_rpc(
        &self,
        service: GitService,
        repo_path: &Path,
        envs: &[(String, String)],
    ) -> Result<Child, GatewayError> {
        let mut cmd = self.command();
        cmd.arg(service.subcommand())
            .arg("--stateless-rpc")
            .arg(repo_path)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(%service, repo = %repo_path.display(), "spawning stateless rpc");
        cmd.spawn()
            .map_err(|e| GatewayError::SubprocessFailure(format!("spawn {service}: {e}")))
    }

    /// Run `git <service> <repo>` attached to this process's own stdio, as
    /// the forced-command dispatcher does.
    pub async fn run_inherited(
        &self,
        service: GitService,
        repo_path: &Path,
        envs: &[(String, String)],
    ) -> Result<ExitStatus, GatewayError> {
        let mut cmd = self.command();
        cmd.arg(service.subcommand())
            .arg(repo_path)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        bounded(self.timeout, cmd.status())
            .await?
            .map_err(|e| GatewayError::SubprocessFailure(format!("spawn {service}: {e}")))
    }

    /// Initialise a bare repository at `path`. A directory that already has a
    /// `HEAD` file is left alone.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn init_bare(&self, path: &Path) -> anyhow::Result<()> {
        if path.join("HEAD").is_file() {
            debug!("bare repo already exists; skipping init");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let output = self
            .command()
            .arg("init")
            .arg("--bare")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to spawn git init --bare")?;

        if !output.status.success() {
            bail!(
                "git init --bare failed (status {}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            );
        }
        Ok(())
    }
}

/// Await `fut`, giving up after `limit` when one is configured.
pub async fn bounded<F, T>(limit: Option<Duration>, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = T>,
{
    match limit {
        None => Ok(fut.await),
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            warn!(timeout_secs = limit.as_secs(), "git subprocess timed out");
            GatewayError::SubprocessFailure(format!("timed out after {}s", limit.as_secs()))
        }),
    }
}

/// True when a usable git binary is on `PATH`. Tests that need git skip
/// themselves otherwise.
#[cfg(test)]
pub(crate) fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner() -> GitRunner {
        GitRunner::new(&GitConfig::default())
    }

    #[tokio::test]
    async fn bounded_passes_through_without_limit() {
        assert_eq!(bounded(None, async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn bounded_times_out() {
        let slow = tokio::time::sleep(Duration::from_secs(5));
        let err = bounded(Some(Duration::from_millis(10)), slow).await.unwrap_err();
        assert!(matches!(err, GatewayError::SubprocessFailure(_)));
    }

    #[tokio::test]
    async fn advertise_refs_on_fresh_repo() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("alice").join("pub.git");
        let git = runner();
        git.init_bare(&repo).await.unwrap();
        // Second call is a no-op.
        git.init_bare(&repo).await.unwrap();

        let refs = git
            .advertise_refs(GitService::UploadPack, &repo, None)
            .await
            .unwrap();
        // An empty repository still advertises capabilities.
        assert!(!refs.is_empty());

        git.update_server_info(&repo).await.unwrap();
        assert!(repo.join("info").join("refs").exists());
    }

    #[tokio::test]
    async fn advertise_refs_on_missing_repo_fails() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let err = runner()
            .advertise_refs(GitService::UploadPack, &dir.path().join("nope.git"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SubprocessFailure(_)));
    }
}
