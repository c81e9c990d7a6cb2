//! SQLite-backed task queue.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::RetryConfig;
use crate::order::{parse_ts, ts};

use super::{FailDisposition, NewTask, QueueCounts, QueueError, Task, TaskStatus, TaskStore};

const TASK_COLUMNS: &str = "id, kind, dedup_key, status, attempts, max_attempts, run_after, lease_expires_at, last_error, created_at, updated_at";

/// SQLite-backed task store.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

fn db<E: std::fmt::Display>(e: E) -> QueueError {
    QueueError::Database(e.to_string())
}

impl SqliteTaskStore {
    /// Open (or create) the task tables in the database at `path`.
    pub fn new(path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path).map_err(db)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory task store (useful for testing).
    pub fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().map_err(db)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), QueueError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                dedup_key TEXT UNIQUE,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                run_after TEXT NOT NULL,
                lease_expires_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_runnable ON tasks(status, run_after);
            "#,
        )
        .map_err(db)
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let kind: String = row.get(1)?;
        let kind = serde_json::from_str(&kind).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let status: String = row.get(3)?;
        let lease: Option<String> = row.get(7)?;

        Ok(Task {
            id: row.get(0)?,
            kind,
            dedup_key: row.get(2)?,
            status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
            attempts: row.get(4)?,
            max_attempts: row.get(5)?,
            run_after: parse_ts(&row.get::<_, String>(6)?),
            lease_expires_at: lease.as_deref().map(parse_ts),
            last_error: row.get(8)?,
            created_at: parse_ts(&row.get::<_, String>(9)?),
            updated_at: parse_ts(&row.get::<_, String>(10)?),
        })
    }

    fn query_task(conn: &Connection, id: &str) -> Result<Option<Task>, QueueError> {
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS),
            params![id],
            Self::row_to_task,
        )
        .optional()
        .map_err(db)
    }

    fn query_by_key(conn: &Connection, key: &str) -> Result<Option<Task>, QueueError> {
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE dedup_key = ?", TASK_COLUMNS),
            params![key],
            Self::row_to_task,
        )
        .optional()
        .map_err(db)
    }

    /// Load a task that must be running.
    fn running_task(conn: &Connection, id: &str) -> Result<Task, QueueError> {
        let task = Self::query_task(conn, id)?.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Running {
            return Err(QueueError::NotRunning {
                id: id.to_string(),
                actual: task.status.as_str().to_string(),
            });
        }
        Ok(task)
    }
}

impl TaskStore for SqliteTaskStore {
    fn enqueue(&self, task: &NewTask) -> Result<Task, QueueError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let kind = serde_json::to_string(&task.kind).map_err(db)?;

        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO tasks ({}) VALUES (?, ?, ?, ?, 0, ?, ?, NULL, NULL, ?, ?)",
                    TASK_COLUMNS
                ),
                params![
                    id,
                    kind,
                    task.dedup_key,
                    TaskStatus::Pending.as_str(),
                    task.max_attempts,
                    ts(task.run_after),
                    ts(now),
                    ts(now)
                ],
            )
            .map_err(db)?;

        if inserted == 0 {
            if let Some(key) = &task.dedup_key {
                if let Some(existing) = Self::query_by_key(&conn, key)? {
                    return Ok(existing);
                }
            }
        }

        Self::query_task(&conn, &id)?.ok_or(QueueError::NotFound(id))
    }

    fn get(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let conn = self.conn.lock().unwrap();
        Self::query_task(&conn, id)
    }

    fn find_by_dedup_key(&self, key: &str) -> Result<Option<Task>, QueueError> {
        let conn = self.conn.lock().unwrap();
        Self::query_by_key(&conn, key)
    }

    fn claim(
        &self,
        now: DateTime<Utc>,
        lease: std::time::Duration,
    ) -> Result<Option<Task>, QueueError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db)?;
        let now_ts = ts(now);

        let id: Option<String> = tx
            .query_row(
                "SELECT id FROM tasks
                 WHERE (status IN ('pending', 'failed_retryable') AND run_after <= ?1)
                    OR (status = 'running' AND lease_expires_at <= ?1)
                 ORDER BY run_after, created_at
                 LIMIT 1",
                params![now_ts],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;

        let Some(id) = id else {
            return Ok(None);
        };

        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::hours(1));
        tx.execute(
            "UPDATE tasks SET status = 'running', attempts = attempts + 1, lease_expires_at = ?, updated_at = ? WHERE id = ?",
            params![ts(now + lease), now_ts, id],
        )
        .map_err(db)?;

        let task = Self::query_task(&tx, &id)?;
        tx.commit().map_err(db)?;
        Ok(task)
    }

    fn succeed(&self, id: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        Self::running_task(&conn, id)?;
        conn.execute(
            "UPDATE tasks SET status = 'succeeded', lease_expires_at = NULL, last_error = NULL, updated_at = ? WHERE id = ?",
            params![ts(Utc::now()), id],
        )
        .map_err(db)?;
        Ok(())
    }

    fn fail(
        &self,
        id: &str,
        error: &str,
        retryable: bool,
        retry: &RetryConfig,
        now: DateTime<Utc>,
    ) -> Result<FailDisposition, QueueError> {
        let conn = self.conn.lock().unwrap();
        let task = Self::running_task(&conn, id)?;

        if retryable && task.attempts < task.max_attempts {
            let delay = chrono::Duration::from_std(retry.delay_for_attempt(task.attempts))
                .unwrap_or(chrono::Duration::zero());
            let run_after = now + delay;
            conn.execute(
                "UPDATE tasks SET status = 'failed_retryable', run_after = ?, lease_expires_at = NULL, last_error = ?, updated_at = ? WHERE id = ?",
                params![ts(run_after), error, ts(now), id],
            )
            .map_err(db)?;
            return Ok(FailDisposition::Rescheduled { run_after });
        }

        conn.execute(
            "UPDATE tasks SET status = 'failed_terminal', lease_expires_at = NULL, last_error = ?, updated_at = ? WHERE id = ?",
            params![error, ts(now), id],
        )
        .map_err(db)?;
        Ok(FailDisposition::Exhausted)
    }

    fn list(&self, status: Option<TaskStatus>, limit: i64) -> Result<Vec<Task>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match status {
            Some(_) => conn.prepare(&format!(
                "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at LIMIT ?2",
                TASK_COLUMNS
            )),
            None => conn.prepare(&format!(
                "SELECT {} FROM tasks WHERE ?1 IS NULL ORDER BY created_at LIMIT ?2",
                TASK_COLUMNS
            )),
        }
        .map_err(db)?;

        let rows = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit],
                Self::row_to_task,
            )
            .map_err(db)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(db)?);
        }
        Ok(tasks)
    }

    fn counts(&self) -> Result<QueueCounts, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .map_err(db)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db)?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row.map_err(db)?;
            counts.insert(status, count);
        }
        Ok(QueueCounts::from_map(&counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskKind;
    use chrono::Duration;

    fn item_task(id: &str) -> NewTask {
        NewTask::new(
            TaskKind::ProcessItem {
                item_id: id.to_string(),
                order_id: "o1".to_string(),
            },
            3,
        )
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay_secs: 20,
            max_delay_secs: 3600,
            backoff_multiplier: 2.0,
        }
    }

    const LEASE: std::time::Duration = std::time::Duration::from_secs(60);

    #[test]
    fn test_enqueue_deduplicates() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let first = store.enqueue(&item_task("i1")).unwrap();
        let second = store.enqueue(&item_task("i1")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.counts().unwrap().pending, 1);

        store.enqueue(&item_task("i2")).unwrap();
        assert_eq!(store.counts().unwrap().pending, 2);
    }

    #[test]
    fn test_tasks_without_key_are_not_deduplicated() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let refresh = NewTask::new(
            TaskKind::RefreshDeliveryStatus {
                order_id: "o1".to_string(),
            },
            1,
        );
        let a = store.enqueue(&refresh).unwrap();
        let b = store.enqueue(&refresh).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_claim_leases_and_counts_attempt() {
        let store = SqliteTaskStore::in_memory().unwrap();
        store.enqueue(&item_task("i1")).unwrap();
        let now = Utc::now();

        let task = store.claim(now, LEASE).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.attempts, 1);
        assert!(task.lease_expires_at.unwrap() > now);

        // Leased tasks are not handed out twice.
        assert!(store.claim(now, LEASE).unwrap().is_none());
    }

    #[test]
    fn test_expired_lease_is_reclaimed() {
        let store = SqliteTaskStore::in_memory().unwrap();
        store.enqueue(&item_task("i1")).unwrap();
        let now = Utc::now();
        let first = store.claim(now, LEASE).unwrap().unwrap();

        let later = now + Duration::seconds(61);
        let again = store.claim(later, LEASE).unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn test_future_tasks_wait() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let now = Utc::now();
        store
            .enqueue(&item_task("i1").with_run_after(now + Duration::minutes(5)))
            .unwrap();
        assert!(store.claim(now, LEASE).unwrap().is_none());
        assert!(store
            .claim(now + Duration::minutes(6), LEASE)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_retryable_failure_backs_off_then_exhausts() {
        let store = SqliteTaskStore::in_memory().unwrap();
        store.enqueue(&item_task("i1")).unwrap();
        let now = Utc::now();

        let task = store.claim(now, LEASE).unwrap().unwrap();
        let first = store.fail(&task.id, "busy", true, &retry(), now).unwrap();
        assert_eq!(
            first,
            FailDisposition::Rescheduled {
                run_after: now + Duration::seconds(20)
            }
        );
        assert!(store.claim(now, LEASE).unwrap().is_none());

        let t2 = now + Duration::seconds(20);
        store.claim(t2, LEASE).unwrap().unwrap();
        let second = store.fail(&task.id, "busy", true, &retry(), t2).unwrap();
        assert_eq!(
            second,
            FailDisposition::Rescheduled {
                run_after: t2 + Duration::seconds(40)
            }
        );

        let t3 = t2 + Duration::seconds(40);
        store.claim(t3, LEASE).unwrap().unwrap();
        let third = store.fail(&task.id, "busy", true, &retry(), t3).unwrap();
        assert_eq!(third, FailDisposition::Exhausted);

        let stored = store.get(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::FailedTerminal);
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.last_error.as_deref(), Some("busy"));
    }

    #[test]
    fn test_permanent_failure_is_terminal() {
        let store = SqliteTaskStore::in_memory().unwrap();
        store.enqueue(&item_task("i1")).unwrap();
        let now = Utc::now();
        let task = store.claim(now, LEASE).unwrap().unwrap();
        let disposition = store.fail(&task.id, "gone", false, &retry(), now).unwrap();
        assert_eq!(disposition, FailDisposition::Exhausted);
        assert_eq!(store.counts().unwrap().failed_terminal, 1);
    }

    #[test]
    fn test_succeed_requires_running() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let task = store.enqueue(&item_task("i1")).unwrap();
        assert!(matches!(
            store.succeed(&task.id),
            Err(QueueError::NotRunning { .. })
        ));

        store.claim(Utc::now(), LEASE).unwrap();
        store.succeed(&task.id).unwrap();
        let counts = store.counts().unwrap();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.outstanding(), 0);

        // Finished tasks still hold their key.
        let replay = store.enqueue(&item_task("i1")).unwrap();
        assert_eq!(replay.status, TaskStatus::Succeeded);
    }

    #[test]
    fn test_list_by_status() {
        let store = SqliteTaskStore::in_memory().unwrap();
        store.enqueue(&item_task("i1")).unwrap();
        store.enqueue(&item_task("i2")).unwrap();
        store.claim(Utc::now(), LEASE).unwrap();

        assert_eq!(store.list(None, 10).unwrap().len(), 2);
        assert_eq!(store.list(Some(TaskStatus::Running), 10).unwrap().len(), 1);
        assert_eq!(store.list(Some(TaskStatus::Pending), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_file_backed_queue_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        {
            let store = SqliteTaskStore::new(&path).unwrap();
            store.enqueue(&item_task("i1")).unwrap();
        }
        let store = SqliteTaskStore::new(&path).unwrap();
        assert!(store.find_by_dedup_key("item:i1").unwrap().is_some());
    }
}
