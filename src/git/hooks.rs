//! Hook environment and the on-disk shims that carry it.
//!
//! A write dispatch exports a [`HookEnv`] into git's environment. Git passes
//! it on to every hook it spawns; the shims installed in each repository
//! only re-invoke `gitgate hook <name>`, which reads the same variables back.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, instrument};

use crate::auth::access::Principal;
use crate::db::{Repository, User};
use crate::error::GatewayError;

pub const ENV_AUTH_USER_ID: &str = "GITGATE_AUTH_USER_ID";
pub const ENV_AUTH_USER_NAME: &str = "GITGATE_AUTH_USER_NAME";
pub const ENV_AUTH_USER_EMAIL: &str = "GITGATE_AUTH_USER_EMAIL";
pub const ENV_REPO_OWNER_NAME: &str = "GITGATE_REPO_OWNER_NAME";
pub const ENV_REPO_OWNER_SALT_SHA256: &str = "GITGATE_REPO_OWNER_SALT_SHA256";
pub const ENV_REPO_ID: &str = "GITGATE_REPO_ID";
pub const ENV_REPO_NAME: &str = "GITGATE_REPO_NAME";
pub const ENV_REPO_IS_WIKI: &str = "GITGATE_REPO_IS_WIKI";
pub const ENV_REPO_CUSTOM_HOOKS_PATH: &str = "GITGATE_REPO_CUSTOM_HOOKS_PATH";
pub const ENV_PUSH_ID: &str = "GITGATE_PUSH_ID";
pub const ENV_CONFIG: &str = "GITGATE_CONFIG";

/// Hook slots that get a shim.
pub const HOOK_NAMES: [&str; 3] = ["pre-receive", "update", "post-receive"];

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Identity and correlation data handed from a dispatch to its hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEnv {
    /// `None` for deploy-key pushes.
    pub user_id: Option<i64>,
    pub user_name: String,
    pub user_email: String,
    pub owner_name: String,
    pub owner_salt_sha256: String,
    pub repo_id: i64,
    pub repo_name: String,
    pub is_wiki: bool,
    pub custom_hooks_path: PathBuf,
    /// Correlation id shared by every hook invocation of one push.
    pub push_id: String,
    pub config_path: PathBuf,
}

/// Inputs for [`HookEnv::compose`].
pub struct HookContext<'a> {
    pub principal: &'a Principal,
    pub owner: &'a User,
    pub repo: &'a Repository,
    pub repo_path: &'a Path,
    pub is_wiki: bool,
    pub custom_hooks_dir: &'a str,
    pub config_path: &'a Path,
}

impl HookEnv {
    /// Build the block for a new push, minting a fresh correlation id.
    pub fn compose(ctx: &HookContext<'_>) -> Self {
        let user = ctx.principal.user();
        Self {
            user_id: user.map(|u| u.id),
            user_name: user.map(|u| u.name.clone()).unwrap_or_default(),
            user_email: user.map(|u| u.email.clone()).unwrap_or_default(),
            owner_name: ctx.owner.name.clone(),
            owner_salt_sha256: ctx.owner.salt_digest(),
            repo_id: ctx.repo.id,
            repo_name: ctx.repo.name.clone(),
            is_wiki: ctx.is_wiki,
            custom_hooks_path: ctx.repo_path.join(ctx.custom_hooks_dir),
            push_id: uuid::Uuid::new_v4().to_string(),
            config_path: ctx.config_path.to_path_buf(),
        }
    }

    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            (
                ENV_AUTH_USER_ID.to_string(),
                self.user_id.unwrap_or(0).to_string(),
            ),
            (ENV_AUTH_USER_NAME.to_string(), self.user_name.clone()),
            (ENV_AUTH_USER_EMAIL.to_string(), self.user_email.clone()),
            (ENV_REPO_OWNER_NAME.to_string(), self.owner_name.clone()),
            (
                ENV_REPO_OWNER_SALT_SHA256.to_string(),
                self.owner_salt_sha256.clone(),
            ),
            (ENV_REPO_ID.to_string(), self.repo_id.to_string()),
            (ENV_REPO_NAME.to_string(), self.repo_name.clone()),
            (ENV_REPO_IS_WIKI.to_string(), self.is_wiki.to_string()),
            (
                ENV_REPO_CUSTOM_HOOKS_PATH.to_string(),
                self.custom_hooks_path.display().to_string(),
            ),
            (ENV_PUSH_ID.to_string(), self.push_id.clone()),
            (ENV_CONFIG.to_string(), self.config_path.display().to_string()),
        ]
    }

    /// Read the block back. `Ok(None)` when no repository id is present,
    /// i.e. the push did not come through a dispatch.
    pub fn from_lookup<F>(get: F) -> Result<Option<Self>, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(repo_id) = get(ENV_REPO_ID).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let repo_id = repo_id.parse::<i64>().map_err(|_| {
            GatewayError::ProtocolMalformed(format!("{ENV_REPO_ID} is not a number: {repo_id}"))
        })?;
        let push_id = get(ENV_PUSH_ID)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::ProtocolMalformed(format!("{ENV_PUSH_ID} is not set")))?;
        let user_id = get(ENV_AUTH_USER_ID)
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|id| *id > 0);

        Ok(Some(Self {
            user_id,
            user_name: get(ENV_AUTH_USER_NAME).unwrap_or_default(),
            user_email: get(ENV_AUTH_USER_EMAIL).unwrap_or_default(),
            owner_name: get(ENV_REPO_OWNER_NAME).unwrap_or_default(),
            owner_salt_sha256: get(ENV_REPO_OWNER_SALT_SHA256).unwrap_or_default(),
            repo_id,
            repo_name: get(ENV_REPO_NAME).unwrap_or_default(),
            is_wiki: get(ENV_REPO_IS_WIKI).as_deref() == Some("true"),
            custom_hooks_path: get(ENV_REPO_CUSTOM_HOOKS_PATH)
                .map(PathBuf::from)
                .unwrap_or_default(),
            push_id,
            config_path: get(ENV_CONFIG).map(PathBuf::from).unwrap_or_default(),
        }))
    }

    pub fn from_process_env() -> Result<Option<Self>, GatewayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

// ---------------------------------------------------------------------------
// Shims
// ---------------------------------------------------------------------------

/// Script body for one hook slot. `update` forwards git's three arguments.
pub fn shim_script(hook: &str, script_type: &str, app_path: &Path, config_path: &Path) -> String {
    let args = if hook == "update" { " $1 $2 $3" } else { "" };
    format!(
        "#!/usr/bin/env {script_type}\n\"{}\" hook --config='{}' {hook}{args}\n",
        app_path.display(),
        config_path.display(),
    )
}

/// Write (or overwrite) the three shims of a bare repository.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn install_shims(
    repo_path: &Path,
    script_type: &str,
    app_path: &Path,
    config_path: &Path,
) -> anyhow::Result<()> {
    let hooks_dir = repo_path.join("hooks");
    tokio::fs::create_dir_all(&hooks_dir)
        .await
        .with_context(|| format!("failed to create {}", hooks_dir.display()))?;

    for hook in HOOK_NAMES {
        let path = hooks_dir.join(hook);
        let script = shim_script(hook, script_type, app_path, config_path);
        tokio::fs::write(&path, script)
            .await
            .with_context(|| format!("failed to write hook {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .with_context(|| format!("failed to chmod hook {}", path.display()))?;
        }
    }
    debug!("hook shims installed");
    Ok(())
}
