//! Command dispatcher (`gitgate serv key-<id>`).
//!
//! Runs as a short-lived process per SSH exec, either spawned by the built-in
//! SSH server or as the forced command of a system sshd. Its stdout is the
//! git wire, so every message meant for the user goes to stderr and every
//! detailed diagnostic goes to the log file.

use std::io::Write;
use std::path::PathBuf;

use tracing::{error, info, instrument, warn};

use crate::auth::access::Principal;
use crate::auth::credentials;
use crate::error::GatewayError;
use crate::git::{self, GitService, HookContext, HookEnv};
use crate::push;
use crate::AppState;

pub const GREETING: &str = "Hi there, you've successfully authenticated, but gitgate does not provide shell access.";

/// Everything needed to exec git once a request has been authorised.
#[derive(Debug)]
pub struct Dispatch {
    pub service: GitService,
    pub repo_path: PathBuf,
    /// Present for write services only.
    pub hook_env: Option<HookEnv>,
}

/// Parse `key-<id>`.
pub fn parse_key_arg(arg: &str) -> Result<i64, GatewayError> {
    arg.strip_prefix("key-")
        .and_then(|id| id.parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| GatewayError::AuthenticationFailed(format!("invalid key argument '{arg}'")))
}

/// Resolve, authorise and prepare one command. Nothing is spawned here.
#[instrument(skip(state), fields(command = %command))]
pub async fn authorize(state: &AppState, key_id: i64, command: &str) -> Result<Dispatch, GatewayError> {
    let parsed = git::parse_ssh_command(git::clean_command(command))?;
    let (owner, repo) = state.resolve_repo(&parsed.repo).await?;
    let principal = credentials::principal_for_key(&state.db, key_id).await?;

    state
        .access()
        .decide(&principal, &repo, parsed.service.required_mode())
        .await?
        .into_result()?;

    if matches!(principal, Principal::User(_)) {
        state.db.keys().touch(key_id).await?;
    }

    let repo_path = state.repo_path(&owner, &repo, parsed.repo.is_wiki);
    let hook_env = parsed.service.is_write().then(|| {
        HookEnv::compose(&HookContext {
            principal: &principal,
            owner: &owner,
            repo: &repo,
            repo_path: &repo_path,
            is_wiki: parsed.repo.is_wiki,
            custom_hooks_dir: &state.config.repository.custom_hooks_dir,
            config_path: &state.config_path,
        })
    });

    info!(
        principal = %principal.describe(),
        service = %parsed.service,
        repo = %repo_path.display(),
        "dispatch authorised"
    );
    Ok(Dispatch {
        service: parsed.service,
        repo_path,
        hook_env,
    })
}

/// Exec git for an authorised dispatch and run the push reaction after a
/// write. Returns git's exit code.
pub async fn execute(
    state: &AppState,
    dispatch: &Dispatch,
    git_protocol: Option<&str>,
) -> Result<i32, GatewayError> {
    let mut envs = dispatch
        .hook_env
        .as_ref()
        .map(HookEnv::to_env)
        .unwrap_or_default();
    if let Some(proto) = git_protocol {
        envs.push(("GIT_PROTOCOL".to_string(), proto.to_string()));
    }

    let status = state
        .git
        .run_inherited(dispatch.service, &dispatch.repo_path, &envs)
        .await;

    let Some(hook_env) = &dispatch.hook_env else {
        return Ok(status?.code().unwrap_or(1));
    };

    match status {
        Ok(status) if status.success() => {
            let effects = state.push_effects();
            match push::react(&state.db, &effects, hook_env).await {
                Ok(applied) => info!(push_id = %hook_env.push_id, applied, "push reaction complete"),
                Err(e) => error!(push_id = %hook_env.push_id, error = %e, "push reaction failed"),
            }
            Ok(0)
        }
        Ok(status) => {
            push::discard(&state.db, &hook_env.push_id).await?;
            warn!(push_id = %hook_env.push_id, %status, "receive-pack failed");
            Ok(status.code().unwrap_or(1))
        }
        Err(e) => {
            push::discard(&state.db, &hook_env.push_id).await?;
            Err(e)
        }
    }
}

/// Process entry point. Writes client-facing lines to `stderr` and returns
/// the exit code.
pub async fn serve<W: Write>(
    state: &AppState,
    key_arg: &str,
    original_command: Option<&str>,
    git_protocol: Option<&str>,
    stderr: &mut W,
) -> i32 {
    if state.config.ssh.disabled {
        let _ = writeln!(stderr, "gitgate: SSH has been disabled");
        return 0;
    }

    let key_id = match parse_key_arg(key_arg) {
        Ok(id) => id,
        Err(e) => return fail(state, stderr, &e),
    };

    let command = match original_command.map(str::trim) {
        Some(cmd) if !cmd.is_empty() => cmd,
        _ => {
            let _ = writeln!(stderr, "{GREETING}");
            return 0;
        }
    };

    let dispatch = match authorize(state, key_id, command).await {
        Ok(dispatch) => dispatch,
        Err(e) => return fail(state, stderr, &e),
    };

    match execute(state, &dispatch, git_protocol).await {
        Ok(code) => code,
        Err(e) => fail(state, stderr, &e),
    }
}

/// One generic line for the client, the detail for the log (and for the
/// client too in dev mode).
fn fail<W: Write>(state: &AppState, stderr: &mut W, err: &GatewayError) -> i32 {
    error!(error = %err, "serv failed");
    let _ = writeln!(stderr, "gitgate: {}", err.public_message());
    if state.config.is_dev() {
        let _ = writeln!(stderr, "{err}");
    }
    1
}
