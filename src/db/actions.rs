use chrono::Utc;
use sqlx::SqlitePool;

use super::error::Result;
use super::models::Action;

/// Fields of a new feed entry.
#[derive(Debug, Clone)]
pub struct NewAction<'a> {
    pub user_id: Option<i64>,
    pub repo_id: i64,
    pub op_type: &'a str,
    pub ref_name: &'a str,
    pub old_oid: &'a str,
    pub new_oid: &'a str,
}

pub struct Actions<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Actions<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, action: &NewAction<'_>) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO actions (user_id, repo_id, op_type, ref_name, old_oid, new_oid, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(action.user_id)
        .bind(action.repo_id)
        .bind(action.op_type)
        .bind(action.ref_name)
        .bind(action.old_oid)
        .bind(action.new_oid)
        .bind(Utc::now())
        .execute(self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_by_repo(&self, repo_id: i64) -> Result<Vec<Action>> {
        let rows = sqlx::query_as::<_, Action>(
            "SELECT * FROM actions WHERE repo_id = ? ORDER BY id",
        )
        .bind(repo_id)
        .fetch_all(self.pool)
        .await?;
        Ok(rows)
    }
}
