use chrono::Utc;
use sqlx::SqlitePool;

use super::error::{Error, Result};
use super::models::AuthorizedKey;
use crate::auth::access::AccessMode;

pub struct Keys<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Keys<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a user key. `content` must already be normalised to
    /// `"<algorithm> <base64>"`.
    pub async fn add_user_key(&self, user_id: i64, name: &str, content: &str) -> Result<AuthorizedKey> {
        self.insert(Some(user_id), None, name, content, AccessMode::Write)
            .await
    }

    /// Register a key scoped to one repository with its own mode ceiling.
    pub async fn add_deploy_key(
        &self,
        repo_id: i64,
        name: &str,
        content: &str,
        mode: AccessMode,
    ) -> Result<AuthorizedKey> {
        if mode == AccessMode::None {
            return Err(Error::InvalidData(
                "deploy key mode must be read or write".to_string(),
            ));
        }
        self.insert(None, Some(repo_id), name, content, mode).await
    }

    async fn insert(
        &self,
        owner_user_id: Option<i64>,
        repo_id: Option<i64>,
        name: &str,
        content: &str,
        mode: AccessMode,
    ) -> Result<AuthorizedKey> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO authorized_keys (owner_user_id, repo_id, name, content, mode, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(owner_user_id)
        .bind(repo_id)
        .bind(name)
        .bind(content)
        .bind(mode)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;

        self.get_by_id(result.last_insert_rowid()).await
    }

    pub async fn get_by_id(&self, id: i64) -> Result<AuthorizedKey> {
        sqlx::query_as::<_, AuthorizedKey>("SELECT * FROM authorized_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("key id {id}")))
    }

    /// Exact match on the stored key text.
    pub async fn find_by_content(&self, content: &str) -> Result<Option<AuthorizedKey>> {
        let key = sqlx::query_as::<_, AuthorizedKey>(
            "SELECT * FROM authorized_keys WHERE content = ?",
        )
        .bind(content)
        .fetch_optional(self.pool)
        .await?;
        Ok(key)
    }

    /// Record use of the key.
    pub async fn touch(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE authorized_keys SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}
