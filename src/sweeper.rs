// Periodic retention cleanup. Mirrors the teacher's `purge_old_data`
// background task: a single transaction running both age-cutoff deletes, and
// an optional `tokio::spawn`ed ticker wrapping it for hosts that want a
// fire-and-forget background job instead of driving `run()` themselves.
use crate::error::PubsubError;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct Sweeper {
    store: Arc<Store>,
    delivered_retention: Duration,
    undelivered_retention: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<Store>, delivered_retention: Duration, undelivered_retention: Duration) -> Self {
        Self {
            store,
            delivered_retention,
            undelivered_retention,
        }
    }

    /// Deletes delivered rows older than `delivered_retention` and
    /// undelivered rows older than `undelivered_retention`, both inside one
    /// transaction so a reader never observes one cutoff applied without the
    /// other.
    pub async fn run(&self) -> Result<(u64, u64), PubsubError> {
        let now = now_f64();
        let delivered_cutoff = now - self.delivered_retention.as_secs_f64();
        let undelivered_cutoff = now - self.undelivered_retention.as_secs_f64();

        let mut tx = self.store.pool().begin().await?;

        let delivered_result = sqlx::query(
            "DELETE FROM messages WHERE delivered_at IS NOT NULL AND delivered_at < ?",
        )
        .bind(delivered_cutoff)
        .execute(&mut *tx)
        .await?;

        let undelivered_result = sqlx::query(
            "DELETE FROM messages WHERE delivered_at IS NULL AND created_at < ?",
        )
        .bind(undelivered_cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let (delivered_count, undelivered_count) =
            (delivered_result.rows_affected(), undelivered_result.rows_affected());
        info!(
            delivered_count,
            undelivered_count,
            "sweeper purged old messages"
        );
        Ok((delivered_count, undelivered_count))
    }

    /// Runs `run()` on `interval`, logging failures instead of propagating
    /// them — a sweep that fails once should not take the whole task down.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run().await {
                    error!(error = %e, "sweeper run failed");
                }
            }
        })
    }
}

fn now_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NewMessage;

    #[tokio::test]
    async fn sweeps_both_categories_in_one_pass() {
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let now = now_f64();

        store
            .insert_batch(&[NewMessage {
                session_id: "s".into(),
                event_type: "e".into(),
                data: None,
                created_at: now - 7_200.0,
            }])
            .await
            .unwrap();
        let stale = store.fetch_undelivered("s", 0, 100).await.unwrap();
        store.mark_delivered(&[stale[0].id], now - 7_200.0).await.unwrap();

        store
            .insert_batch(&[NewMessage {
                session_id: "s".into(),
                event_type: "e".into(),
                data: None,
                created_at: now - 90_000.0,
            }])
            .await
            .unwrap();

        store
            .insert_batch(&[NewMessage {
                session_id: "s".into(),
                event_type: "e".into(),
                data: None,
                created_at: now - 60.0,
            }])
            .await
            .unwrap();

        let sweeper = Sweeper::new(
            Arc::clone(&store),
            Duration::from_secs(3_600),
            Duration::from_secs(86_400),
        );
        let (delivered_count, undelivered_count) = sweeper.run().await.unwrap();
        assert_eq!(delivered_count, 1);
        assert_eq!(undelivered_count, 1);

        let remaining = store.fetch_undelivered("s", 0, 100).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn run_is_idempotent_when_nothing_is_stale() {
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let sweeper = Sweeper::new(
            Arc::clone(&store),
            Duration::from_secs(3_600),
            Duration::from_secs(86_400),
        );
        assert_eq!(sweeper.run().await.unwrap(), (0, 0));
    }
}
