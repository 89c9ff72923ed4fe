//! Platform hook subcommands (`gitgate hook ...`).
//!
//! Git runs these through the shims in each repository's `hooks/`
//! directory. `update` runs once per ref as its own process and records the
//! transition under the push's correlation id. `post-receive` marks the
//! recorded rows of the refs git actually updated. All three then hand over
//! to an operator script of the same name in the custom hooks directory, if
//! there is one.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use crate::db::Database;
use crate::error::GatewayError;
use crate::git::HookEnv;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookCommand {
    PreReceive,
    Update {
        ref_name: String,
        old_oid: String,
        new_oid: String,
    },
    PostReceive,
}

impl HookCommand {
    pub fn name(&self) -> &'static str {
        match self {
            HookCommand::PreReceive => "pre-receive",
            HookCommand::Update { .. } => "update",
            HookCommand::PostReceive => "post-receive",
        }
    }

    fn args(&self) -> Vec<&str> {
        match self {
            HookCommand::Update {
                ref_name,
                old_oid,
                new_oid,
            } => vec![ref_name, old_oid, new_oid],
            _ => Vec::new(),
        }
    }
}

/// Run one hook invocation and return its exit code. `stdin` is the ref list
/// git feeds pre-/post-receive; `update` ignores it.
#[instrument(skip(db, env, stdin, stderr), fields(hook = hook.name()))]
pub async fn run<W: Write>(
    db: &Database,
    hook: &HookCommand,
    env: Option<&HookEnv>,
    stdin: &[u8],
    stderr: &mut W,
) -> i32 {
    let Some(env) = env else {
        debug!("no gateway environment; nothing to do");
        return 0;
    };

    if let HookCommand::Update { ref_name, old_oid, new_oid } = hook {
        if let Err(e) = record_update(db, env, ref_name, old_oid, new_oid).await {
            error!(error = %e, "failed to record update task");
            let _ = writeln!(stderr, "gitgate: {}", e.public_message());
            return 1;
        }
    }
    if *hook == HookCommand::PostReceive {
        if let Err(e) = confirm_updates(db, env, stdin).await {
            error!(error = %e, "failed to confirm update tasks");
            let _ = writeln!(stderr, "gitgate: {}", e.public_message());
            return 1;
        }
    }

    let script = env.custom_hooks_path.join(hook.name());
    let input = match hook {
        HookCommand::Update { .. } => None,
        _ => Some(stdin),
    };
    match run_custom_hook(&script, &hook.args(), input).await {
        Ok(true) => 0,
        Ok(false) => {
            if let HookCommand::Update { ref_name, .. } = hook {
                // The ref is being rejected; its row must not reach the reaction.
                if let Err(e) = db.update_tasks().delete_ref(&env.push_id, ref_name).await {
                    error!(error = %e, "failed to withdraw update task");
                }
            }
            warn!(script = %script.display(), "custom hook rejected the push");
            1
        }
        Err(e) => {
            error!(script = %script.display(), error = %e, "custom hook failed to run");
            let _ = writeln!(stderr, "gitgate: {}", e.public_message());
            if let HookCommand::Update { ref_name, .. } = hook {
                if let Err(e) = db.update_tasks().delete_ref(&env.push_id, ref_name).await {
                    error!(error = %e, "failed to withdraw update task");
                }
            }
            1
        }
    }
}

async fn record_update(
    db: &Database,
    env: &HookEnv,
    ref_name: &str,
    old_oid: &str,
    new_oid: &str,
) -> Result<(), GatewayError> {
    if ref_name.is_empty() {
        return Err(GatewayError::ProtocolMalformed("empty ref name".to_string()));
    }
    let id = db
        .update_tasks()
        .insert(&env.push_id, ref_name, old_oid, new_oid)
        .await?;
    info!(task_id = id, push_id = %env.push_id, %ref_name, "update task recorded");
    Ok(())
}

/// Confirm every `<old> <new> <ref>` line git passes to post-receive. git
/// lists exactly the refs it updated.
async fn confirm_updates(db: &Database, env: &HookEnv, stdin: &[u8]) -> Result<(), GatewayError> {
    let input = String::from_utf8_lossy(stdin);
    for line in input.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [_old, new, ref_name] = fields.as_slice() else {
            return Err(GatewayError::ProtocolMalformed(format!(
                "unexpected post-receive line '{line}'"
            )));
        };
        let marked = db.update_tasks().confirm(&env.push_id, ref_name, new).await?;
        if marked == 0 {
            debug!(%ref_name, "updated ref has no recorded task");
        }
    }
    Ok(())
}

/// Run an operator hook if `script` is a file. `Ok(true)` when it is absent
/// or exits zero.
async fn run_custom_hook(script: &Path, args: &[&str], stdin: Option<&[u8]>) -> Result<bool, GatewayError> {
    if !script.is_file() {
        return Ok(true);
    }
    let mut cmd = Command::new(script);
    cmd.args(args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .kill_on_drop(true);
    // Custom hooks live in `<repo>/custom_hooks/`; run them from the repo.
    if let Some(repo_dir) = script.parent().and_then(Path::parent) {
        cmd.current_dir(repo_dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| GatewayError::SubprocessFailure(format!("spawn {}: {e}", script.display())))?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A hook that exits without reading its input is not an error.
        if let Err(e) = pipe.write_all(input).await {
            debug!(error = %e, "custom hook closed stdin early");
        }
    }
    let status = child
        .wait()
        .await
        .map_err(|e| GatewayError::SubprocessFailure(format!("wait {}: {e}", script.display())))?;
    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;
    use crate::db::models::ZERO_OID;

    fn env(push_id: &str, hooks: PathBuf) -> HookEnv {
        HookEnv {
            user_id: Some(1),
            user_name: "alice".into(),
            user_email: String::new(),
            owner_name: "alice".into(),
            owner_salt_sha256: String::new(),
            repo_id: 1,
            repo_name: "repo".into(),
            is_wiki: false,
            custom_hooks_path: hooks,
            push_id: push_id.into(),
            config_path: PathBuf::new(),
        }
    }

    fn update(ref_name: &str) -> HookCommand {
        HookCommand::Update {
            ref_name: ref_name.into(),
            old_oid: ZERO_OID.into(),
            new_oid: "a".repeat(40),
        }
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn without_env_hooks_do_nothing() {
        let db = Database::in_memory().await.unwrap();
        let mut err = Vec::new();
        assert_eq!(run(&db, &update("refs/heads/a"), None, b"", &mut err).await, 0);
        assert!(err.is_empty());
    }

    #[tokio::test]
    async fn sibling_updates_share_one_push_id() {
        let db = Database::in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let env = env("push-x", dir.path().join("custom_hooks"));
        let mut err = Vec::new();

        for r in ["refs/heads/a", "refs/heads/b"] {
            assert_eq!(run(&db, &update(r), Some(&env), b"", &mut err).await, 0);
        }
        let rows = db.update_tasks().claim("push-x").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.push_id == "push-x"));
    }

    #[tokio::test]
    async fn empty_ref_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let env = env("p", dir.path().join("custom_hooks"));
        let mut err = Vec::new();
        assert_eq!(run(&db, &update(""), Some(&env), b"", &mut err).await, 1);
        assert_eq!(db.update_tasks().count("p").await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejecting_custom_update_withdraws_the_row() {
        let db = Database::in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let hooks = dir.path().join("custom_hooks");
        write_script(&hooks, "update", r#"[ "$1" != "refs/heads/blocked" ]"#);
        let env = env("p", hooks);
        let mut err = Vec::new();

        assert_eq!(run(&db, &update("refs/heads/ok"), Some(&env), b"", &mut err).await, 0);
        assert_eq!(run(&db, &update("refs/heads/blocked"), Some(&env), b"", &mut err).await, 1);

        let rows = db.update_tasks().claim("p").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ref_name, "refs/heads/ok");
    }

    #[tokio::test]
    async fn post_receive_confirms_only_listed_refs() {
        let db = Database::in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let env = env("p", dir.path().join("custom_hooks"));
        let mut err = Vec::new();

        for r in ["refs/heads/master", "refs/heads/b"] {
            assert_eq!(run(&db, &update(r), Some(&env), b"", &mut err).await, 0);
        }
        // git refused refs/heads/b, so only master reaches post-receive.
        let input = format!("{ZERO_OID} {} refs/heads/master\n", "a".repeat(40));
        assert_eq!(
            run(&db, &HookCommand::PostReceive, Some(&env), input.as_bytes(), &mut err).await,
            0
        );

        let rows = db.update_tasks().claim("p").await.unwrap();
        let state: Vec<_> = rows.iter().map(|t| (t.ref_name.as_str(), t.confirmed)).collect();
        assert_eq!(state, vec![("refs/heads/master", true), ("refs/heads/b", false)]);
    }

    #[tokio::test]
    async fn malformed_post_receive_input_fails() {
        let db = Database::in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let env = env("p", dir.path().join("custom_hooks"));
        let mut err = Vec::new();
        assert_eq!(
            run(&db, &HookCommand::PostReceive, Some(&env), b"garbage\n", &mut err).await,
            1
        );
        assert!(String::from_utf8(err).unwrap().starts_with("gitgate: "));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pre_receive_forwards_stdin() {
        let db = Database::in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let hooks = dir.path().join("custom_hooks");
        let seen = dir.path().join("seen");
        write_script(&hooks, "pre-receive", &format!("cat > '{}'", seen.display()));
        let env = env("p", hooks);
        let mut err = Vec::new();

        let input = b"0000 1111 refs/heads/main\n";
        assert_eq!(run(&db, &HookCommand::PreReceive, Some(&env), input, &mut err).await, 0);
        assert_eq!(std::fs::read(&seen).unwrap(), input);
    }
}
