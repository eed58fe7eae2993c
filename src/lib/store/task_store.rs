//! Durable task storage on an embedded SQLite database.
//!
//! Every mutation runs in one `IMMEDIATE` transaction, so there is a single
//! writer at a time. Mutations that change resource usage recompute the
//! aggregate from the full task set inside that transaction and publish it
//! to the cache before the connection lock is released.
//!
//! Lock order is connection then aggregate. Never take the connection lock
//! while holding the aggregate lock.

use std::path::Path;

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::{debug, info};
use uuid::Uuid;

use super::record::TaskRecord;
use crate::lib::tasks::types::{
    AggregateMetrics, Task, TaskDefinition, TaskError, TaskResult, TaskStatus,
};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id     BLOB PRIMARY KEY NOT NULL,
    status INTEGER NOT NULL,
    body   BLOB NOT NULL
) WITHOUT ROWID;
";

pub struct TaskStore {
    conn: Mutex<Connection>,
    agg_metrics: RwLock<AggregateMetrics>,
}

impl TaskStore {
    pub fn open(path: impl AsRef<Path>) -> TaskResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )?;
        info!(path = %path.display(), "opening task store");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> TaskResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> TaskResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;

        let tasks = read_all(&conn)?;
        let agg = AggregateMetrics::from_tasks(&tasks);
        info!(
            total_tasks = agg.total_tasks,
            allocated_cpu = agg.allocated_cpu,
            allocated_mem = agg.allocated_mem,
            "task store ready"
        );

        Ok(TaskStore {
            conn: Mutex::new(conn),
            agg_metrics: RwLock::new(agg),
        })
    }

    /// Runs `f` inside a write transaction. With `recompute` the aggregate is
    /// rebuilt from the committed task set.
    fn write<T, F>(&self, recompute: bool, f: F) -> TaskResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> TaskResult<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let out = f(&tx)?;
        let agg = if recompute {
            Some(AggregateMetrics::from_tasks(&read_all(&tx)?))
        } else {
            None
        };

        tx.commit()?;

        if let Some(agg) = agg {
            *self.agg_metrics.write() = agg;
        }

        Ok(out)
    }

    pub fn create_task(&self, def: &TaskDefinition) -> TaskResult<Task> {
        let task = Task::new(def)?;
        let record = TaskRecord::encode(&task)?;

        self.write(true, |tx| {
            tx.execute(
                "INSERT INTO tasks (id, status, body) VALUES (?1, ?2, ?3)",
                params![&task.id.as_bytes()[..], record.status.as_i64(), record.body],
            )?;
            Ok(())
        })?;

        debug!(task_id = %task.id, cpu = task.cpu, memory = task.memory, "task created");
        Ok(task)
    }

    pub fn get_task(&self, id: Uuid) -> TaskResult<Task> {
        let conn = self.conn.lock();
        read_one(&conn, id)
    }

    /// Snapshot of every task, oldest first.
    pub fn get_tasks(&self) -> TaskResult<Vec<Task>> {
        let conn = self.conn.lock();
        read_all(&conn)
    }

    /// Flips the stored status and mirrors it onto `task`. The rest of the
    /// stored record is left as it was.
    pub fn set_task_status(&self, task: &mut Task, status: TaskStatus) -> TaskResult<()> {
        let id = task.id;

        self.write(false, |tx| {
            let mut stored = read_one(tx, id)?;
            stored.status = status;
            let record = TaskRecord::encode(&stored)?;

            tx.execute(
                "UPDATE tasks SET status = ?2, body = ?3 WHERE id = ?1",
                params![&id.as_bytes()[..], record.status.as_i64(), record.body],
            )?;
            Ok(())
        })?;

        task.status = status;
        debug!(task_id = %id, ?status, "task status set");
        Ok(())
    }

    /// Compare-and-set on the status: writes `status` only when `allow`
    /// accepts the currently stored one. Returns the replaced status, or
    /// `None` when nothing was written.
    pub fn transition_task_status<F>(
        &self,
        id: Uuid,
        status: TaskStatus,
        allow: F,
    ) -> TaskResult<Option<TaskStatus>>
    where
        F: FnOnce(TaskStatus) -> bool,
    {
        self.write(false, |tx| {
            let mut stored = read_one(tx, id)?;
            let previous = stored.status;
            if !allow(previous) {
                return Ok(None);
            }

            stored.status = status;
            let record = TaskRecord::encode(&stored)?;
            tx.execute(
                "UPDATE tasks SET status = ?2, body = ?3 WHERE id = ?1",
                params![&id.as_bytes()[..], record.status.as_i64(), record.body],
            )?;
            Ok(Some(previous))
        })
    }

    /// Replaces the whole record. Fails with `NotFound` if the task was deleted.
    pub fn update_task(&self, task: &Task) -> TaskResult<()> {
        let record = TaskRecord::encode(task)?;

        self.write(true, |tx| {
            let changed = tx.execute(
                "UPDATE tasks SET status = ?2, body = ?3 WHERE id = ?1",
                params![&task.id.as_bytes()[..], record.status.as_i64(), record.body],
            )?;
            if changed == 0 {
                return Err(TaskError::NotFound(task.id));
            }
            Ok(())
        })
    }

    pub fn delete_task(&self, id: Uuid) -> TaskResult<()> {
        self.write(true, |tx| {
            let changed = tx.execute(
                "DELETE FROM tasks WHERE id = ?1",
                params![&id.as_bytes()[..]],
            )?;
            if changed == 0 {
                return Err(TaskError::NotFound(id));
            }
            Ok(())
        })?;

        debug!(task_id = %id, "task deleted");
        Ok(())
    }

    pub fn agg_metrics(&self) -> AggregateMetrics {
        *self.agg_metrics.read()
    }
}

fn read_one(conn: &Connection, id: Uuid) -> TaskResult<Task> {
    let row: Option<(i64, Vec<u8>)> = conn
        .query_row(
            "SELECT status, body FROM tasks WHERE id = ?1",
            params![&id.as_bytes()[..]],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((status, body)) => TaskRecord::decode(id, status, &body),
        None => Err(TaskError::NotFound(id)),
    }
}

fn read_all(conn: &Connection) -> TaskResult<Vec<Task>> {
    let mut stmt = conn.prepare("SELECT id, status, body FROM tasks ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, Vec<u8>>(2)?,
        ))
    })?;

    let mut tasks = Vec::new();
    for row in rows {
        let (raw_id, status, body) = row?;
        let id = Uuid::from_slice(&raw_id).map_err(|err| TaskError::CorruptRecord {
            id: Uuid::nil(),
            reason: format!("bad key: {}", err),
        })?;
        tasks.push(TaskRecord::decode(id, status, &body)?);
    }

    Ok(tasks)
}
