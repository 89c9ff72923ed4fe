use chrono::Utc;
use sqlx::SqlitePool;

use super::error::{Error, Result};
use super::models::Repository;
use crate::auth::access::AccessMode;

pub struct Repos<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Repos<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        owner_id: i64,
        name: &str,
        is_private: bool,
        is_mirror: bool,
    ) -> Result<Repository> {
        let result = sqlx::query(
            "INSERT INTO repositories (owner_id, name, is_private, is_mirror, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(owner_id)
        .bind(name.to_lowercase())
        .bind(is_private)
        .bind(is_mirror)
        .bind(Utc::now())
        .execute(self.pool)
        .await?;

        self.get_by_id(result.last_insert_rowid()).await
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Repository> {
        sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("repository id {id}")))
    }

    pub async fn get_by_owner_and_name(&self, owner_id: i64, name: &str) -> Result<Repository> {
        sqlx::query_as::<_, Repository>(
            "SELECT * FROM repositories WHERE owner_id = ? AND name = ?",
        )
        .bind(owner_id)
        .bind(name.to_lowercase())
        .fetch_optional(self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("repository {owner_id}/{name}")))
    }

    /// Every repository paired with its owner's name, for hook syncing.
    pub async fn list_with_owner(&self) -> Result<Vec<(Repository, String)>> {
        let repos = sqlx::query_as::<_, Repository>("SELECT * FROM repositories ORDER BY id")
            .fetch_all(self.pool)
            .await?;
        let mut out = Vec::with_capacity(repos.len());
        for repo in repos {
            let owner: (String,) = sqlx::query_as("SELECT name FROM users WHERE id = ?")
                .bind(repo.owner_id)
                .fetch_one(self.pool)
                .await?;
            out.push((repo, owner.0));
        }
        Ok(out)
    }

    pub async fn set_collaborator(&self, repo_id: i64, user_id: i64, mode: AccessMode) -> Result<()> {
        sqlx::query(
            "INSERT INTO collaborations (user_id, repo_id, mode) VALUES (?, ?, ?)
             ON CONFLICT (user_id, repo_id) DO UPDATE SET mode = excluded.mode",
        )
        .bind(user_id)
        .bind(repo_id)
        .bind(mode)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Stored collaborator mode, `None` when the user is not a collaborator.
    pub async fn collaborator_mode(&self, repo_id: i64, user_id: i64) -> Result<Option<AccessMode>> {
        let mode = sqlx::query_scalar::<_, AccessMode>(
            "SELECT mode FROM collaborations WHERE repo_id = ? AND user_id = ?",
        )
        .bind(repo_id)
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;
        Ok(mode)
    }
}
