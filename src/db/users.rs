use chrono::Utc;
use sqlx::SqlitePool;
use tracing::instrument;

use super::error::{Error, Result};
use super::models::User;
use crate::auth::password;

pub struct Users<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Users<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a user with an argon2 password hash and a fresh salt.
    pub async fn create(&self, name: &str, email: &str, plain_password: &str) -> Result<User> {
        let hash = password::hash_password(plain_password)
            .map_err(|e| Error::InvalidData(e.to_string()))?;
        let salt = uuid::Uuid::new_v4().simple().to_string();

        let result = sqlx::query(
            "INSERT INTO users (name, email, password_hash, salt, two_factor_enabled, created_at)
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(name.to_lowercase())
        .bind(email)
        .bind(&hash)
        .bind(&salt)
        .bind(Utc::now())
        .execute(self.pool)
        .await?;

        self.get_by_id(result.last_insert_rowid()).await
    }

    pub async fn get_by_id(&self, id: i64) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user id {id}")))
    }

    /// Names are stored lower-case; lookups are case-insensitive.
    pub async fn get_by_name(&self, name: &str) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE name = ?")
            .bind(name.to_lowercase())
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user '{name}'")))
    }

    /// Owner of a (non-deploy) public key.
    pub async fn get_by_key_id(&self, key_id: i64) -> Result<User> {
        sqlx::query_as::<_, User>(
            "SELECT users.* FROM users
             JOIN authorized_keys ON authorized_keys.owner_user_id = users.id
             WHERE authorized_keys.id = ?",
        )
        .bind(key_id)
        .fetch_optional(self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("owner of key {key_id}")))
    }

    /// Interactive login. `Ok(None)` means bad credentials, never an error.
    #[instrument(skip(self, plain_password))]
    pub async fn authenticate(&self, name: &str, plain_password: &str) -> Result<Option<User>> {
        let user = match self.get_by_name(name).await {
            Ok(user) => user,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let ok = password::verify_password(plain_password, &user.password_hash)
            .map_err(|e| Error::InvalidData(e.to_string()))?;
        Ok(ok.then_some(user))
    }

    pub async fn set_two_factor(&self, user_id: i64, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE users SET two_factor_enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(user_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;

    #[tokio::test]
    async fn create_and_authenticate() {
        let db = Database::in_memory().await.unwrap();
        let alice = db
            .users()
            .create("Alice", "alice@example.com", "hunter2")
            .await
            .unwrap();
        assert_eq!(alice.name, "alice");

        let found = db.users().authenticate("ALICE", "hunter2").await.unwrap();
        assert_eq!(found.map(|u| u.id), Some(alice.id));

        assert!(db.users().authenticate("alice", "wrong").await.unwrap().is_none());
        assert!(db.users().authenticate("nobody", "hunter2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let db = Database::in_memory().await.unwrap();
        let err = db.users().get_by_name("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
