//! Push Reaction.
//!
//! Runs once `receive-pack` has exited successfully: claims every
//! [`UpdateTask`] recorded under the push's correlation id and applies the
//! side effects that are only safe for an accepted push. Claiming deletes the
//! rows in the same statement that reads them, so a repeated call for the
//! same id finds nothing and does nothing.
//!
//! receive-pack can exit zero and still refuse refs whose `update` hook
//! passed (an atomic push failing on a sibling ref, a stale old value). Only
//! rows that post-receive confirmed are applied; the rest are dropped.

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::db::actions::NewAction;
use crate::db::models::ZERO_OID;
use crate::db::{Database, UpdateTask};
use crate::error::GatewayError;
use crate::git::HookEnv;

const BRANCH_PREFIX: &str = "refs/heads/";
const TAG_PREFIX: &str = "refs/tags/";

// ---------------------------------------------------------------------------
// Operation types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    CreateBranch,
    DeleteBranch,
    Push,
    CreateTag,
    DeleteTag,
}

impl OpType {
    /// Classify a ref transition from its name and the zero object id.
    pub fn classify(ref_name: &str, old_oid: &str, new_oid: &str) -> Self {
        let is_tag = ref_name.starts_with(TAG_PREFIX);
        match (old_oid == ZERO_OID, new_oid == ZERO_OID, is_tag) {
            (_, true, true) => OpType::DeleteTag,
            (_, true, false) => OpType::DeleteBranch,
            (_, false, true) => OpType::CreateTag,
            (true, false, false) => OpType::CreateBranch,
            (false, false, false) => OpType::Push,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpType::CreateBranch => "create_branch",
            OpType::DeleteBranch => "delete_branch",
            OpType::Push => "push",
            OpType::CreateTag => "create_tag",
            OpType::DeleteTag => "delete_tag",
        }
    }

    fn is_deletion(self) -> bool {
        matches!(self, OpType::DeleteBranch | OpType::DeleteTag)
    }
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// Side effects of an accepted ref update.
#[async_trait]
pub trait PushEffects: Send + Sync {
    async fn record_action(&self, env: &HookEnv, task: &UpdateTask, op: OpType) -> anyhow::Result<()>;

    /// Ask the platform to run delivery and pull-request tasks for a branch.
    async fn trigger_tasks(&self, env: &HookEnv, branch: &str) -> anyhow::Result<()>;
}

/// Feed rows in the local database plus an HTTP poke at the platform's task
/// trigger endpoint.
pub struct LiveEffects {
    db: Database,
    http: reqwest::Client,
    local_root_url: String,
}

impl LiveEffects {
    pub fn new(db: Database, http: reqwest::Client, local_root_url: impl Into<String>) -> Self {
        Self {
            db,
            http,
            local_root_url: local_root_url.into(),
        }
    }

    /// `{root}{owner}/{repo}/tasks/trigger`; the query is added by reqwest.
    fn trigger_url(&self, env: &HookEnv) -> String {
        format!(
            "{}{}/{}/tasks/trigger",
            self.local_root_url, env.owner_name, env.repo_name
        )
    }
}

#[async_trait]
impl PushEffects for LiveEffects {
    async fn record_action(&self, env: &HookEnv, task: &UpdateTask, op: OpType) -> anyhow::Result<()> {
        self.db
            .actions()
            .insert(&NewAction {
                user_id: env.user_id,
                repo_id: env.repo_id,
                op_type: op.as_str(),
                ref_name: &task.ref_name,
                old_oid: &task.old_oid,
                new_oid: &task.new_oid,
            })
            .await?;
        Ok(())
    }

    async fn trigger_tasks(&self, env: &HookEnv, branch: &str) -> anyhow::Result<()> {
        if self.local_root_url.is_empty() {
            return Ok(());
        }
        let pusher = env.user_id.unwrap_or(0).to_string();
        let url = self.trigger_url(env);
        debug!(%url, %branch, "triggering repository tasks");
        self.http
            .get(&url)
            .query(&[
                ("branch", branch),
                ("secret", env.owner_salt_sha256.as_str()),
                ("pusher", pusher.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

/// Apply the effects of a successful push. Returns how many confirmed ref
/// updates were consumed. A replay returns `0` and touches nothing.
#[instrument(skip(db, effects, env), fields(push_id = %env.push_id, repo_id = env.repo_id))]
pub async fn react(db: &Database, effects: &dyn PushEffects, env: &HookEnv) -> Result<usize, GatewayError> {
    let (tasks, refused): (Vec<_>, Vec<_>) = db
        .update_tasks()
        .claim(&env.push_id)
        .await?
        .into_iter()
        .partition(|task| task.confirmed);
    for task in &refused {
        warn!(ref_name = %task.ref_name, "ref was not updated by git; dropping its task");
    }
    if tasks.is_empty() {
        debug!("no confirmed update tasks for push");
        return Ok(0);
    }
    if env.is_wiki {
        debug!(count = tasks.len(), "wiki push; effects skipped");
        return Ok(tasks.len());
    }

    for task in &tasks {
        let op = OpType::classify(&task.ref_name, &task.old_oid, &task.new_oid);
        if let Err(e) = effects.record_action(env, task, op).await {
            error!(ref_name = %task.ref_name, error = %e, "failed to record push action");
        }
        if op.is_deletion() {
            continue;
        }
        if let Some(branch) = task.ref_name.strip_prefix(BRANCH_PREFIX) {
            if let Err(e) = effects.trigger_tasks(env, branch).await {
                warn!(%branch, error = %e, "failed to trigger repository tasks");
            }
        }
    }
    info!(count = tasks.len(), "push applied");
    Ok(tasks.len())
}

/// Drop the rows of a push that git did not accept.
pub async fn discard(db: &Database, push_id: &str) -> Result<usize, GatewayError> {
    let tasks = db.update_tasks().claim(push_id).await?;
    if !tasks.is_empty() {
        warn!(%push_id, count = tasks.len(), "discarded update tasks of failed push");
    }
    Ok(tasks.len())
}
