//! Proxy leasing: `LeaseFreeProxy`, `BlockProxy`,
//! `ReleaseProxy`.

use super::models::Proxy;
use super::retry::with_retry;
use super::{Store, StoreError};

impl Store {
    /// Selects uniformly at random among `FREE` rows (not simply the
    /// lowest id) to spread load across the proxy pool, using the same
    /// skip-locked discipline as `lease_next_task`.
    pub async fn lease_free_proxy(&self, worker_id: &str) -> Result<Option<Proxy>, StoreError> {
        let proxy = with_retry("lease_free_proxy", || async {
            let mut tx = self.pool.begin().await?;
            let candidate = sqlx::query_as::<_, Proxy>(
                "SELECT * FROM proxies WHERE status = 'FREE' \
                 ORDER BY random() LIMIT 1 FOR UPDATE SKIP LOCKED",
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some(candidate) = candidate else {
                tx.commit().await?;
                return Ok(None);
            };

            let leased = sqlx::query_as::<_, Proxy>(
                "UPDATE proxies SET status = 'IN_USE', worker_id = $1, taken_at = now() \
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
        Ok(proxy)
    }

    /// Terminal: a blocked proxy never automatically returns to `FREE`.
    pub async fn block_proxy(&self, proxy_id: i64, reason: &str) -> Result<(), StoreError> {
        with_retry("block_proxy", || async {
            sqlx::query(
                "UPDATE proxies SET status = 'BLOCKED', blocked_at = now(), \
                 blocked_reason = $1, worker_id = NULL, taken_at = NULL WHERE id = $2",
            )
            .bind(reason)
            .bind(proxy_id)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn release_proxy(&self, proxy_id: i64) -> Result<(), StoreError> {
        with_retry("release_proxy", || async {
            sqlx::query(
                "UPDATE proxies SET status = 'FREE', worker_id = NULL, taken_at = NULL \
                 WHERE id = $1 AND status = 'IN_USE'",
            )
            .bind(proxy_id)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }
}
