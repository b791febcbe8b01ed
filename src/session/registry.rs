use std::path::{Path, PathBuf};

use anyhow::Context;
use sqlx::{Row, SqlitePool};

/// Durable registry of in-flight transfer tasks, keyed by source URL.
///
/// A row exists from the moment a task first touches the network until it
/// terminates cleanly (success or cancel). A row that is still present at
/// startup therefore describes an orphaned task, and together with its
/// partial file it is the resume-data the coordinator recovers from.
#[derive(Clone)]
pub struct TaskRegistry {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub source_url: String,
    pub partial_path: PathBuf,
    pub bytes_received: i64,
}

impl TaskRegistry {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("current_dir")?
                .join(db_path)
        };

        let mut p = abs.to_string_lossy().to_string();
        if cfg!(windows) {
            p = p.replace('\\', "/");
        }

        // mode=rwc so the database is created on first use
        let url = if p.starts_with('/') {
            format!("sqlite://{}?mode=rwc", p)
        } else {
            format!("sqlite:///{}?mode=rwc", p)
        };

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .with_context(|| format!("connect sqlite url={} (file={})", url, abs.display()))?;

        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
              source_url TEXT PRIMARY KEY,
              partial_path TEXT NOT NULL,
              bytes_received INTEGER NOT NULL DEFAULT 0,
              updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn now_epoch() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    pub async fn upsert_task(&self, source_url: &str, partial_path: &Path) -> anyhow::Result<()> {
        let now = Self::now_epoch();

        sqlx::query(
            r#"
            INSERT INTO tasks(source_url, partial_path, bytes_received, updated_at)
            VALUES(?, ?, 0, ?)
            ON CONFLICT(source_url) DO UPDATE
            SET partial_path = excluded.partial_path,
                updated_at = excluded.updated_at;
            "#,
        )
        .bind(source_url)
        .bind(partial_path.to_string_lossy().to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_bytes_received(&self, source_url: &str, bytes: i64) -> anyhow::Result<()> {
        let now = Self::now_epoch();

        sqlx::query(
            r#"
            UPDATE tasks
            SET bytes_received = ?, updated_at = ?
            WHERE source_url = ?;
            "#,
        )
        .bind(bytes)
        .bind(now)
        .bind(source_url)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove_task(&self, source_url: &str) -> anyhow::Result<()> {
        sqlx::query(r#"DELETE FROM tasks WHERE source_url = ?;"#)
            .bind(source_url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_tasks(&self) -> anyhow::Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT source_url, partial_path, bytes_received
            FROM tasks
            ORDER BY updated_at ASC;
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| TaskRecord {
                source_url: r.get::<String, _>("source_url"),
                partial_path: PathBuf::from(r.get::<String, _>("partial_path")),
                bytes_received: r.get::<i64, _>("bytes_received"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, TaskRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = TaskRegistry::open(&dir.path().join("tasks.sqlite"))
            .await
            .unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn upsert_list_remove_roundtrip() {
        let (_dir, registry) = open_temp().await;

        registry
            .upsert_task("https://x/a.zip", Path::new("/tmp/a.partial"))
            .await
            .unwrap();
        registry
            .set_bytes_received("https://x/a.zip", 1234)
            .await
            .unwrap();

        let tasks = registry.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source_url, "https://x/a.zip");
        assert_eq!(tasks[0].partial_path, PathBuf::from("/tmp/a.partial"));
        assert_eq!(tasks[0].bytes_received, 1234);

        registry.remove_task("https://x/a.zip").await.unwrap();
        assert!(registry.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_url() {
        let (_dir, registry) = open_temp().await;

        registry
            .upsert_task("https://x/a.zip", Path::new("/tmp/a.partial"))
            .await
            .unwrap();
        registry
            .set_bytes_received("https://x/a.zip", 77)
            .await
            .unwrap();
        registry
            .upsert_task("https://x/a.zip", Path::new("/tmp/a.partial"))
            .await
            .unwrap();

        let tasks = registry.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        // Re-registering a live task must not reset its progress.
        assert_eq!(tasks[0].bytes_received, 77);
    }

    #[tokio::test]
    async fn removing_unknown_task_is_a_noop() {
        let (_dir, registry) = open_temp().await;
        registry.remove_task("https://x/missing.zip").await.unwrap();
    }
}
