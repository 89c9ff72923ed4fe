use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use super::error::{Error, Result};
use super::models::AccessToken;

/// Hex SHA-256 under which a token is stored. Plaintext never touches disk.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub struct Tokens<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Tokens<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Mint a new token for `user_id`. Returns the stored row and the
    /// plaintext, which is shown once and cannot be recovered afterwards.
    pub async fn create(&self, user_id: i64, name: &str) -> Result<(AccessToken, String)> {
        let plain = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let result = sqlx::query(
            "INSERT INTO access_tokens (user_id, name, sha256, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(name)
        .bind(token_digest(&plain))
        .bind(Utc::now())
        .execute(self.pool)
        .await?;

        let row = sqlx::query_as::<_, AccessToken>("SELECT * FROM access_tokens WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(self.pool)
            .await?;
        Ok((row, plain))
    }

    pub async fn get_by_plaintext(&self, token: &str) -> Result<AccessToken> {
        sqlx::query_as::<_, AccessToken>("SELECT * FROM access_tokens WHERE sha256 = ?")
            .bind(token_digest(token))
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| Error::NotFound("access token".to_string()))
    }

    pub async fn touch(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE access_tokens SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn token_resolves_by_plaintext_only() {
        let db = Database::in_memory().await.unwrap();
        let user = db.users().create("bob", "", "pw").await.unwrap();
        let (row, plain) = db.tokens().create(user.id, "ci").await.unwrap();

        assert_ne!(row.sha256, plain);
        assert_eq!(row.sha256, token_digest(&plain));
        assert!(row.last_used_at.is_none());

        let found = db.tokens().get_by_plaintext(&plain).await.unwrap();
        assert_eq!(found.user_id, user.id);
        assert!(db.tokens().get_by_plaintext(&row.sha256).await.unwrap_err().is_not_found());

        db.tokens().touch(row.id).await.unwrap();
        let touched = db.tokens().get_by_plaintext(&plain).await.unwrap();
        assert!(touched.last_used_at.is_some());
    }
}
