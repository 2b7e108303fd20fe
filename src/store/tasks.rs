//! Task leasing: `LeaseNextTask`, `Heartbeat`,
//! `ReturnTaskToQueue`, `MarkTaskAsError`, `CompleteTask`,
//! `ReturnStuckTasks`, `GetTaskRetryCount`.
//!
//! The skip-locked lease (`FOR UPDATE SKIP LOCKED` inside a transaction) is
//! the sole correctness mechanism preventing two workers from taking the
//! same row; see `DESIGN.md` for the grounding example this pattern is
//! adapted from.

use chrono::{DateTime, TimeZone, Utc};

use super::models::{ProcessingStatus, Task};
use super::retry::{self, with_retry};
use super::{Store, StoreError};

/// Outcome of a `ReturnStuckTasks` sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct StuckSweepReport {
    pub returned_to_queue: u32,
    pub marked_error: u32,
}

impl Store {
    pub async fn lease_next_task(&self, worker_id: &str) -> Result<Option<Task>, StoreError> {
        let task = with_retry("lease_next_task", || async {
            let mut tx = self.pool.begin().await?;
            let candidate = sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE status = 'NEW' \
                 ORDER BY created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some(candidate) = candidate else {
                tx.commit().await?;
                return Ok(None);
            };

            let leased = sqlx::query_as::<_, Task>(
                "UPDATE tasks SET status = 'IN_PROGRESS', worker_id = $1, \
                 taken_at = now(), last_heartbeat = now() \
                 WHERE id = $2 RETURNING *",
            )
            .bind(worker_id)
            .bind(candidate.id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(Some(leased))
        })
        .await?;
        Ok(task)
    }

    pub async fn get_task_retry_count(&self, task_id: i64) -> Result<i32, StoreError> {
        let (count,): (i32,) = with_retry("get_task_retry_count", || async {
            sqlx::query_as("SELECT retry_count FROM tasks WHERE id = $1")
                .bind(task_id)
                .fetch_one(&self.pool)
                .await
        })
        .await?;
        Ok(count)
    }

    /// Heartbeat silently tolerates a closed pool — the worker may be
    /// heartbeating a task whose owning process is mid-shutdown.
    pub async fn heartbeat(&self, task_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET last_heartbeat = now() WHERE id = $1 AND status = 'IN_PROGRESS'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if retry::is_benign_during_shutdown(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn return_task_to_queue(
        &self,
        task_id: i64,
        error: &str,
        increment_retry: bool,
    ) -> Result<(), StoreError> {
        with_retry("return_task_to_queue", || async {
            sqlx::query(
                "UPDATE tasks SET status = 'NEW', worker_id = NULL, taken_at = NULL, \
                 last_heartbeat = NULL, error_message = $1, \
                 retry_count = retry_count + $2 WHERE id = $3",
            )
            .bind(error)
            .bind(if increment_retry { 1 } else { 0 })
            .bind(task_id)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn mark_task_as_error(&self, task_id: i64, error: &str) -> Result<(), StoreError> {
        with_retry("mark_task_as_error", || async {
            sqlx::query("UPDATE tasks SET status = 'ERROR', error_message = $1 WHERE id = $2")
                .bind(error)
                .bind(task_id)
                .execute(&self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Marks a task DONE and upserts its `ProcessedArticle` row in one
    /// transaction.
    pub async fn complete_task(
        &self,
        task_id: i64,
        article: &str,
        worker_id: &str,
        processing_status: ProcessingStatus,
        items_found: i32,
        items_passed: i32,
    ) -> Result<(), StoreError> {
        with_retry("complete_task", || async {
            let mut tx = self.pool.begin().await?;

            let (started_at,): (Option<DateTime<Utc>>,) =
                sqlx::query_as("SELECT taken_at FROM tasks WHERE id = $1")
                    .bind(task_id)
                    .fetch_one(&mut *tx)
                    .await?;

            sqlx::query("UPDATE tasks SET status = 'DONE', completed_at = now() WHERE id = $1")
                .bind(task_id)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO processed_articles \
                 (article, processed_at, processing_status, items_found, items_passed, started_at, worker_id) \
                 VALUES ($1, now(), $2, $3, $4, $5, $6) \
                 ON CONFLICT (article) DO UPDATE SET \
                    processed_at = excluded.processed_at, \
                    processing_status = excluded.processing_status, \
                    items_found = excluded.items_found, \
                    items_passed = excluded.items_passed, \
                    started_at = excluded.started_at, \
                    worker_id = excluded.worker_id",
            )
            .bind(article)
            .bind(processing_status)
            .bind(items_found)
            .bind(items_passed)
            .bind(started_at)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// For every `IN_PROGRESS` row whose `last_heartbeat` predates
    /// `stuck_task_timeout`: returns it to `NEW` with an incremented
    /// `retry_count` when budget remains, otherwise marks it `ERROR`. This
    /// is the retry-budget-respecting variant (see `DESIGN.md`).
    pub async fn return_stuck_tasks(
        &self,
        stuck_task_timeout: std::time::Duration,
        max_retry_attempts: i32,
    ) -> Result<StuckSweepReport, StoreError> {
        let threshold = Utc::now()
            - chrono::Duration::from_std(stuck_task_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));

        let stuck: Vec<Task> = with_retry("return_stuck_tasks:select", || async {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE status = 'IN_PROGRESS' AND last_heartbeat < $1",
            )
            .bind(threshold)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        let mut report = StuckSweepReport::default();
        for task in stuck {
            if task.retry_count < max_retry_attempts {
                self.return_task_to_queue(task.id, "stuck: heartbeat timeout exceeded", true)
                    .await?;
                report.returned_to_queue += 1;
            } else {
                self.mark_task_as_error(task.id, "stuck timeout exceeded").await?;
                report.marked_error += 1;
            }
        }
        Ok(report)
    }
}

/// Sentinel timestamp for deleted listings.
pub fn deleted_listing_timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).single().expect("1970-01-01 is a valid date")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_listing_timestamp_is_the_unix_epoch() {
        let ts = deleted_listing_timestamp();
        assert_eq!(ts.timestamp(), 0);
    }
}
