use super::KeyValueStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS kv_entries_expires_at ON kv_entries (expires_at);
"#;

/// Persistent store backed by an embedded SQLite database.
///
/// Expiry is stored as unix milliseconds; reads ignore rows past it.
pub struct SqliteStore {
    db: SqlitePool,
    sweeper: Option<JoinHandle<()>>,
}

fn storage_err(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(storage_err)?
            .create_if_missing(true);
        let db = SqlitePool::connect_with(options).await.map_err(storage_err)?;
        Self::from_pool(db).await
    }

    /// Use an existing pool. The schema is applied on first use.
    pub async fn from_pool(db: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&db)
            .await
            .map_err(storage_err)?;
        Ok(Self { db, sweeper: None })
    }

    /// Delete expired rows every `interval` in the background.
    pub fn with_cleanup(mut self, interval: Duration) -> Self {
        let db = self.db.clone();
        self.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match purge(&db).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "swept expired sqlite entries"),
                    Err(e) => tracing::warn!("sqlite sweep failed: {}", e),
                }
            }
        }));
        self
    }

    /// Delete expired rows now.
    pub async fn sweep(&self) -> Result<u64> {
        purge(&self.db).await
    }
}

async fn purge(db: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?")
        .bind(now_millis())
        .execute(db)
        .await
        .map_err(storage_err)?;
    Ok(result.rows_affected())
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            r#"
            SELECT value
            FROM kv_entries
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.db)
        .await
        .map_err(storage_err)?;

        row.map(|row| row.try_get::<Vec<u8>, _>("value").map_err(storage_err))
            .transpose()
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let expires_at = (!ttl.is_zero()).then(|| now_millis() + ttl.as_millis() as i64);
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.db)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let now = now_millis();
        let expires_at = (!ttl.is_zero()).then(|| now + ttl.as_millis() as i64);
        let result = match expected {
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE kv_entries
                    SET value = ?, expires_at = ?
                    WHERE key = ? AND value = ? AND (expires_at IS NULL OR expires_at > ?)
                    "#,
                )
                .bind(value)
                .bind(expires_at)
                .bind(key)
                .bind(expected)
                .bind(now)
                .execute(&self.db)
                .await
            }
            // an expired row is overwritten, a live one is left alone
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO kv_entries (key, value, expires_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
                    WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= ?
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(expires_at)
                .bind(now)
                .execute(&self.db)
                .await
            }
        }
        .map_err(storage_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.db)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT key
            FROM kv_entries
            WHERE key LIKE ? ESCAPE '\' AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(escape_like(prefix))
        .bind(now_millis())
        .fetch_all(&self.db)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(storage_err))
            .collect()
    }

    async fn count(&self, prefix: &str) -> Result<usize> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM kv_entries
            WHERE key LIKE ? ESCAPE '\' AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(escape_like(prefix))
        .bind(now_millis())
        .fetch_one(&self.db)
        .await
        .map_err(storage_err)?;

        let n: i64 = row.try_get("n").map_err(storage_err)?;
        Ok(n as usize)
    }
}
