//! `gitgate admin ...`: operator bootstrap for the rows the gateway reads.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing::info;

use crate::auth::access::AccessMode;
use crate::auth::credentials::parse_authorized_key;
use crate::db::Repository;
use crate::git::install_shims;
use crate::AppState;

#[derive(Subcommand, Debug)]
pub enum AdminCommand {
    /// Create a user account.
    CreateUser {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long)]
        password: String,
        /// Mark the account as 2FA-enrolled (HTTP then needs a token).
        #[arg(long)]
        two_factor: bool,
    },
    /// Issue an access token; the plaintext is printed once.
    CreateToken {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
    },
    /// Register a user's SSH public key (`<algorithm> <base64> [comment]`).
    AddKey {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        key: String,
    },
    /// Register a key scoped to one repository.
    AddDeployKey {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        key: String,
        #[arg(long, default_value = "read")]
        mode: AccessMode,
    },
    /// Create a repository row, its bare repository and hook shims.
    CreateRepo {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        private: bool,
        #[arg(long)]
        mirror: bool,
        /// Also initialise `{name}.wiki.git`.
        #[arg(long)]
        wiki: bool,
    },
    /// Grant a user a mode on a repository.
    AddCollaborator {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "write")]
        mode: AccessMode,
    },
    /// Rewrite the hook shims of every repository.
    SyncHooks,
}

pub async fn run<W: Write>(state: &AppState, command: AdminCommand, out: &mut W) -> Result<()> {
    let db = &state.db;
    match command {
        AdminCommand::CreateUser {
            name,
            email,
            password,
            two_factor,
        } => {
            let user = db.users().create(&name, &email, &password).await?;
            if two_factor {
                db.users().set_two_factor(user.id, true).await?;
            }
            info!(user_id = user.id, name = %user.name, "user created");
            writeln!(out, "created user {} (id {})", user.name, user.id)?;
        }
        AdminCommand::CreateToken { user, name } => {
            let user = db
                .users()
                .get_by_name(&user)
                .await
                .with_context(|| format!("no such user '{user}'"))?;
            let (token, plaintext) = db.tokens().create(user.id, &name).await?;
            info!(token_id = token.id, user_id = user.id, "access token created");
            writeln!(out, "{plaintext}")?;
        }
        AdminCommand::AddKey { user, name, key } => {
            let user = db
                .users()
                .get_by_name(&user)
                .await
                .with_context(|| format!("no such user '{user}'"))?;
            let content = parse_authorized_key(&key)?;
            let key = db.keys().add_user_key(user.id, &name, &content).await?;
            info!(key_id = key.id, user_id = user.id, "user key added");
            writeln!(out, "added key {} (id {})", key.name, key.id)?;
        }
        AdminCommand::AddDeployKey {
            owner,
            repo,
            name,
            key,
            mode,
        } => {
            let repo = find_repo(state, &owner, &repo).await?;
            let content = parse_authorized_key(&key)?;
            let key = db.keys().add_deploy_key(repo.id, &name, &content, mode).await?;
            info!(key_id = key.id, repo_id = repo.id, %mode, "deploy key added");
            writeln!(out, "added deploy key {} (id {})", key.name, key.id)?;
        }
        AdminCommand::CreateRepo {
            owner,
            name,
            private,
            mirror,
            wiki,
        } => {
            let owner = db
                .users()
                .get_by_name(&owner)
                .await
                .with_context(|| format!("no such user '{owner}'"))?;
            let repo = db.repos().create(owner.id, &name, private, mirror).await?;

            let mut paths = vec![state.repo_path(&owner, &repo, false)];
            if wiki {
                paths.push(state.repo_path(&owner, &repo, true));
            }
            for path in &paths {
                prepare_on_disk(state, path).await?;
            }
            info!(repo_id = repo.id, path = %paths[0].display(), "repository created");
            writeln!(out, "created repository {}/{} (id {})", owner.name, repo.name, repo.id)?;
        }
        AdminCommand::AddCollaborator {
            owner,
            repo,
            user,
            mode,
        } => {
            let repo = find_repo(state, &owner, &repo).await?;
            let user = db
                .users()
                .get_by_name(&user)
                .await
                .with_context(|| format!("no such user '{user}'"))?;
            db.repos().set_collaborator(repo.id, user.id, mode).await?;
            info!(repo_id = repo.id, user_id = user.id, %mode, "collaborator set");
            writeln!(out, "{} now has {mode} on {owner}/{}", user.name, repo.name)?;
        }
        AdminCommand::SyncHooks => {
            let app_path = state.config.app_path()?;
            let mut synced = 0usize;
            for (repo, owner_name) in db.repos().list_with_owner().await? {
                let root = &state.config.repository.root;
                for path in [repo.repo_path(root, &owner_name), repo.wiki_path(root, &owner_name)] {
                    // Wikis are optional; only touch the ones that exist.
                    if !path.join("HEAD").is_file() {
                        continue;
                    }
                    install_shims(
                        &path,
                        &state.config.repository.script_type,
                        &app_path,
                        &state.config_path,
                    )
                    .await?;
                    synced += 1;
                }
            }
            info!(synced, "hook shims rewritten");
            writeln!(out, "rewrote hooks for {synced} repositories")?;
        }
    }
    Ok(())
}

async fn find_repo(state: &AppState, owner: &str, name: &str) -> Result<Repository> {
    let owner = state
        .db
        .users()
        .get_by_name(owner)
        .await
        .with_context(|| format!("no such user '{owner}'"))?;
    state
        .db
        .repos()
        .get_by_owner_and_name(owner.id, &name.to_lowercase())
        .await
        .with_context(|| format!("no such repository '{}/{name}'", owner.name))
}

async fn prepare_on_disk(state: &AppState, path: &std::path::Path) -> Result<()> {
    state.git.init_bare(path).await?;
    install_shims(
        path,
        &state.config.repository.script_type,
        &state.config.app_path()?,
        &state.config_path,
    )
    .await
}

#[cfg(test)]
mod tests {
    use russh_keys::key::KeyPair;
    use tempfile::TempDir;

    use super::*;
    use crate::auth::credentials::canonical_key;
    use crate::config::Config;
    use crate::git::process::git_available;

    async fn state(dir: &TempDir) -> AppState {
        let mut config = Config::default();
        config.repository.root = dir.path().join("repos");
        config.app.app_path = Some("/usr/local/bin/gitgate".into());
        AppState::for_tests(config).await
    }

    fn key_line() -> String {
        let public = KeyPair::generate_ed25519().clone_public_key().unwrap();
        format!("{} ops@host", canonical_key(&public))
    }

    #[tokio::test]
    async fn users_keys_tokens_and_collaborators() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;
        let mut out = Vec::new();

        for name in ["alice", "bob"] {
            run(
                &state,
                AdminCommand::CreateUser {
                    name: name.into(),
                    email: String::new(),
                    password: "pw".into(),
                    two_factor: false,
                },
                &mut out,
            )
            .await
            .unwrap();
        }
        let alice = state.db.users().get_by_name("alice").await.unwrap();
        let bob = state.db.users().get_by_name("bob").await.unwrap();
        let repo = state.db.repos().create(alice.id, "widgets", true, false).await.unwrap();

        run(
            &state,
            AdminCommand::AddKey {
                user: "alice".into(),
                name: "laptop".into(),
                key: key_line(),
            },
            &mut out,
        )
        .await
        .unwrap();
        run(
            &state,
            AdminCommand::AddDeployKey {
                owner: "alice".into(),
                repo: "Widgets".into(),
                name: "ci".into(),
                key: key_line(),
                mode: AccessMode::Read,
            },
            &mut out,
        )
        .await
        .unwrap();
        run(
            &state,
            AdminCommand::AddCollaborator {
                owner: "alice".into(),
                repo: "widgets".into(),
                user: "bob".into(),
                mode: AccessMode::Read,
            },
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(
            state.db.repos().collaborator_mode(repo.id, bob.id).await.unwrap(),
            Some(AccessMode::Read)
        );

        let mut token_out = Vec::new();
        run(
            &state,
            AdminCommand::CreateToken {
                user: "bob".into(),
                name: "ci".into(),
            },
            &mut token_out,
        )
        .await
        .unwrap();
        let token = String::from_utf8(token_out).unwrap();
        let stored = state.db.tokens().get_by_plaintext(token.trim()).await.unwrap();
        assert_eq!(stored.user_id, bob.id);
    }

    #[tokio::test]
    async fn rejects_unknown_owner_and_bad_key() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;
        let mut out = Vec::new();
        assert!(run(
            &state,
            AdminCommand::AddKey {
                user: "ghost".into(),
                name: "k".into(),
                key: key_line(),
            },
            &mut out,
        )
        .await
        .is_err());

        state.db.users().create("alice", "", "pw").await.unwrap();
        assert!(run(
            &state,
            AdminCommand::AddKey {
                user: "alice".into(),
                name: "k".into(),
                key: "ssh-ed25519 garbage".into(),
            },
            &mut out,
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn create_repo_initialises_and_installs_shims() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;
        state.db.users().create("alice", "", "pw").await.unwrap();
        let mut out = Vec::new();

        run(
            &state,
            AdminCommand::CreateRepo {
                owner: "alice".into(),
                name: "Widgets".into(),
                private: false,
                mirror: false,
                wiki: true,
            },
            &mut out,
        )
        .await
        .unwrap();

        let repo_dir = dir.path().join("repos/alice/widgets.git");
        assert!(repo_dir.join("HEAD").is_file());
        assert!(dir.path().join("repos/alice/widgets.wiki.git/HEAD").is_file());
        let shim = std::fs::read_to_string(repo_dir.join("hooks/update")).unwrap();
        assert!(shim.contains("\"/usr/local/bin/gitgate\" hook --config='/etc/gitgate.yaml' update $1 $2 $3"));

        std::fs::write(repo_dir.join("hooks/update"), "stale").unwrap();
        run(&state, AdminCommand::SyncHooks, &mut out).await.unwrap();
        let shim = std::fs::read_to_string(repo_dir.join("hooks/update")).unwrap();
        assert!(shim.starts_with("#!/usr/bin/env bash\n"));
        assert!(String::from_utf8(out).unwrap().contains("rewrote hooks for 2 repositories"));
    }
}
