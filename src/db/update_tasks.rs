//! Per-ref rows written by the `update` hook and consumed after the push.

use chrono::Utc;
use sqlx::SqlitePool;

use super::error::Result;
use super::models::UpdateTask;

pub struct UpdateTasks<'a> {
    pool: &'a SqlitePool,
}

impl<'a> UpdateTasks<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        push_id: &str,
        ref_name: &str,
        old_oid: &str,
        new_oid: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO update_tasks (push_id, ref_name, old_oid, new_oid, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(push_id)
        .bind(ref_name)
        .bind(old_oid)
        .bind(new_oid)
        .bind(Utc::now())
        .execute(self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Remove and return every row of `push_id` in one statement. Two callers
    /// racing on the same id split the rows between them; none is returned
    /// twice.
    pub async fn claim(&self, push_id: &str) -> Result<Vec<UpdateTask>> {
        let mut rows = sqlx::query_as::<_, UpdateTask>(
            "DELETE FROM update_tasks WHERE push_id = ? RETURNING *",
        )
        .bind(push_id)
        .fetch_all(self.pool)
        .await?;
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    /// Mark the row matching a ref git reports as updated. Returns the number
    /// of rows marked; `0` means no `update` hook recorded that transition.
    pub async fn confirm(&self, push_id: &str, ref_name: &str, new_oid: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE update_tasks SET confirmed = 1
             WHERE push_id = ? AND ref_name = ? AND new_oid = ?",
        )
        .bind(push_id)
        .bind(ref_name)
        .bind(new_oid)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Undo the row of a ref whose update was rejected further down the
    /// hook chain.
    pub async fn delete_ref(&self, push_id: &str, ref_name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM update_tasks WHERE push_id = ? AND ref_name = ?")
            .bind(push_id)
            .bind(ref_name)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self, push_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM update_tasks WHERE push_id = ?",
        )
        .bind(push_id)
        .fetch_one(self.pool)
        .await?;
        Ok(count)
    }
}
