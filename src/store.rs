// Schema migrations and the five Store operations the rest of the engine
// reaches persistence through. Keeps the teacher's migration bookkeeping
// (`schema_migrations` table, `include_str!`-embedded SQL, pragma tuning)
// unchanged in shape, generalized to this crate's single `messages` table.
use crate::error::PubsubError;
use crate::message::{Message, MessageRow, NewMessage};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "create_messages",
    sql: include_str!("../migrations/001_create_messages.sql"),
}];

/// Owns persistence. Every other component reaches the database only through
/// these methods.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connects, applies pragma tuning, and runs any pending migrations.
    ///
    /// A single-connection pool is used deliberately: SQLite serializes
    /// writers regardless, and a single connection is what makes
    /// `sqlite::memory:` behave as one database across calls instead of a
    /// fresh one per connection.
    pub async fn connect(database_url: &str) -> Result<Self, PubsubError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Self::tune_pragmas(&pool).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Wraps an already-configured pool (e.g. one the host owns and shares).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn tune_pragmas(pool: &SqlitePool) -> Result<(), PubsubError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA cache_size = -128000")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA mmap_size = 536870912")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA page_size = 8192")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA auto_vacuum = INCREMENTAL")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA wal_autocheckpoint = 1000")
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), PubsubError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at REAL NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        for migration in MIGRATIONS {
            let applied = sqlx::query_as::<_, (i32,)>(
                "SELECT version FROM schema_migrations WHERE version = ?",
            )
            .bind(migration.version)
            .fetch_optional(pool)
            .await?
            .is_some();

            if applied {
                continue;
            }

            info!(version = migration.version, name = migration.name, "running migration");

            let mut tx = pool.begin().await?;
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
            sqlx::query(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)",
            )
            .bind(migration.version)
            .bind(migration.name)
            .bind(now_f64())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
        }

        Ok(())
    }

    /// Acquires and releases a pooled connection; used by hosts to answer a
    /// readiness/liveness check without exposing the pool itself.
    pub async fn health_check(&self) -> Result<(), PubsubError> {
        self.pool.acquire().await?;
        Ok(())
    }

    /// Atomically inserts a batch of rows. Row ids are assigned by SQLite and
    /// not returned — callers learn them only by reading back through
    /// `fetch_undelivered`.
    pub async fn insert_batch(&self, rows: &[NewMessage]) -> Result<(), PubsubError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO messages (session_id, event_type, data, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&row.session_id)
            .bind(&row.event_type)
            .bind(&row.data)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Rows for `session_id` with `delivered_at IS NULL AND id > after_id`,
    /// ascending by `id`, capped at `limit`.
    pub async fn fetch_undelivered(
        &self,
        session_id: &str,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, PubsubError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, session_id, event_type, data, created_at, delivered_at \
             FROM messages \
             WHERE session_id = ? AND delivered_at IS NULL AND id > ? \
             ORDER BY id ASC LIMIT ?",
        )
        .bind(session_id)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    /// Idempotent: marking an already-delivered row delivered again is a no-op.
    pub async fn mark_delivered(&self, ids: &[i64], now: f64) -> Result<(), PubsubError> {
        if ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("UPDATE messages SET delivered_at = ? WHERE id IN ({placeholders})");

        let mut query = sqlx::query(&sql).bind(now);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    pub async fn delete_old_delivered(&self, cutoff: f64) -> Result<u64, PubsubError> {
        let result =
            sqlx::query("DELETE FROM messages WHERE delivered_at IS NOT NULL AND delivered_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_old_undelivered(&self, cutoff: f64) -> Result<u64, PubsubError> {
        let result =
            sqlx::query("DELETE FROM messages WHERE delivered_at IS NULL AND created_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

fn now_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}
