//! Row types.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::auth::access::AccessMode;

/// Object id git uses for "no object" in ref transitions.
pub const ZERO_OID: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    #[serde(skip)]
    pub salt: String,
    pub two_factor_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Hex SHA-256 of the per-user salt. Carried into hook processes so they
    /// can sign callback URLs without ever seeing the salt itself.
    pub fn salt_digest(&self) -> String {
        hex::encode(Sha256::digest(self.salt.as_bytes()))
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AccessToken {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[serde(skip)]
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Repository {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub is_private: bool,
    pub is_mirror: bool,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    /// `{root}/{owner}/{name}.git`, lower-cased the way repositories are
    /// created on disk.
    pub fn repo_path(&self, root: &Path, owner_name: &str) -> PathBuf {
        root.join(owner_name.to_lowercase())
            .join(format!("{}.git", self.name.to_lowercase()))
    }

    /// `{root}/{owner}/{name}.wiki.git`
    pub fn wiki_path(&self, root: &Path, owner_name: &str) -> PathBuf {
        root.join(owner_name.to_lowercase())
            .join(format!("{}.wiki.git", self.name.to_lowercase()))
    }
}

/// A public key allowed to open SSH sessions. Exactly one of
/// `owner_user_id` / `repo_id` is set; the latter marks a deploy key.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuthorizedKey {
    pub id: i64,
    pub owner_user_id: Option<i64>,
    pub repo_id: Option<i64>,
    pub name: String,
    pub content: String,
    /// Ceiling for deploy keys; user keys carry `Write` and defer to
    /// membership.
    pub mode: AccessMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuthorizedKey {
    pub fn is_deploy_key(&self) -> bool {
        self.repo_id.is_some()
    }
}

/// One ref transition recorded by the `update` hook of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UpdateTask {
    pub id: i64,
    pub push_id: String,
    pub ref_name: String,
    pub old_oid: String,
    pub new_oid: String,
    /// git listed the ref on post-receive input, so the update landed.
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

/// Feed entry written once a push is known to be accepted.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Action {
    pub id: i64,
    pub user_id: Option<i64>,
    pub repo_id: i64,
    pub op_type: String,
    pub ref_name: String,
    pub old_oid: String,
    pub new_oid: String,
    pub created_at: DateTime<Utc>,
}
